//! Several servers started and stopped together

use super::socket::SocketServer;
use super::Result;
use crate::stats::{ServerNetworkStatistics, StatisticsSource};
use std::sync::Arc;

#[derive(Default)]
pub struct ServerGroup {
    servers: Vec<Arc<dyn SocketServer>>,
}

impl ServerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, server: Arc<dyn SocketServer>) -> &mut Self {
        self.servers.push(server);
        self
    }

    pub fn servers(&self) -> &[Arc<dyn SocketServer>] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Start every server in order; on failure the ones already started
    /// are stopped again
    pub fn start(&self) -> Result<()> {
        for (index, server) in self.servers.iter().enumerate() {
            if let Err(error) = server.start() {
                tracing::error!(server = server.context().name(), %error, "server failed to start");
                for started in &self.servers[..index] {
                    started.stop();
                }
                return Err(error);
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        for server in self.servers.iter().rev() {
            server.stop();
        }
    }

    /// Sum of every server's counters
    pub fn network_statistics(&self) -> ServerNetworkStatistics {
        let sources = self
            .servers
            .iter()
            .map(|server| server.network_statistics() as Arc<dyn StatisticsSource>)
            .collect();
        ServerNetworkStatistics::new(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSettings;
    use crate::server::{OperationService, ServerContext, SocketService, TcpServer, UdpServer};
    use crate::server::session::Session;
    use std::net::TcpListener;

    struct Sink;

    impl SocketService for Sink {
        fn on_received(&self, _ctx: &Arc<ServerContext>, _session: &Arc<Session>, _data: &[u8]) {}
    }

    #[test]
    fn test_failed_start_rolls_back() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = ServerSettings {
            name: "busy".into(),
            bind_address: taken.local_addr().unwrap().to_string(),
            reuse_address: false,
            ..ServerSettings::default()
        };

        let first: Arc<dyn SocketServer> =
            Arc::new(TcpServer::new(ServerSettings::default(), Arc::new(OperationService::new())).unwrap());
        let second: Arc<dyn SocketServer> = Arc::new(TcpServer::new(busy, Arc::new(Sink)).unwrap());

        let mut group = ServerGroup::new();
        group.add(Arc::clone(&first)).add(second);
        assert!(group.start().is_err());
        assert!(!first.context().is_running());
    }

    #[test]
    fn test_aggregate_statistics() {
        let udp: Arc<dyn SocketServer> = Arc::new(UdpServer::new(ServerSettings::default(), Arc::new(Sink)).unwrap());
        let tcp: Arc<dyn SocketServer> = Arc::new(TcpServer::new(ServerSettings::default(), Arc::new(Sink)).unwrap());
        let mut group = ServerGroup::new();
        group.add(Arc::clone(&udp)).add(Arc::clone(&tcp));
        group.start().unwrap();
        assert_eq!(group.len(), 2);

        udp.network_statistics().add_received(10);
        tcp.network_statistics().add_sent(5);
        let stats = group.network_statistics();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.bytes_received(), 10);
        assert_eq!(stats.bytes_sent(), 5);
        assert_eq!(stats.snapshot().packets_received, 1);

        group.stop();
        assert!(!udp.context().is_running());
        assert!(!tcp.context().is_running());
    }
}
