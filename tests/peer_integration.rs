//! `ClientPeer` against real operation servers

use bytes::Bytes;
use protonnet::config::{ClientSettings, ServerSettings};
use protonnet::peer::codec::{self, Message};
use protonnet::peer::{
    ClientPeer, OperationEvent, OperationRequest, OperationResponse, ReturnCode, SendParameters,
    TcpPeerTransport,
};
use protonnet::server::{OperationService, Session, SocketServer, TcpServer, UdpServer};
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn service() -> OperationService {
    let mut service = OperationService::new();
    service
        .register(1, |request: &OperationRequest, _session: &Arc<Session>| {
            OperationResponse::for_request(request, ReturnCode::Ok).with_payload(request.payload.clone())
        })
        .register(2, |request: &OperationRequest, session: &Arc<Session>| {
            let event = OperationEvent::new(9, Bytes::from_static(b"news"));
            let _ = session.send_message(&Message::Event(event));
            OperationResponse::for_request(request, ReturnCode::Ok)
        })
        .register(3, |request: &OperationRequest, _session: &Arc<Session>| {
            thread::sleep(Duration::from_millis(300));
            OperationResponse::for_request(request, ReturnCode::Ok)
        });
    service
}

fn server_settings(name: &str) -> ServerSettings {
    ServerSettings {
        name: name.to_string(),
        ..ServerSettings::default()
    }
}

fn client_settings() -> ClientSettings {
    ClientSettings {
        ping_interval_ms: 20,
        ..ClientSettings::default()
    }
}

fn peer(addr: SocketAddr) -> ClientPeer<TcpPeerTransport> {
    let settings = client_settings();
    let transport = TcpPeerTransport::connect(addr, &settings).unwrap();
    ClientPeer::new(transport, settings)
}

/// Run the pipeline until `rx` yields
fn pump(peer: &ClientPeer<TcpPeerTransport>, rx: &Receiver<OperationResponse>) -> OperationResponse {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        peer.service();
        if let Ok(response) = rx.try_recv() {
            return response;
        }
        assert!(Instant::now() < deadline, "no response");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_request_response_over_tcp() {
    let server = TcpServer::new(server_settings("peer-tcp"), Arc::new(service())).unwrap();
    server.start().unwrap();
    let peer = peer(server.local_addr().unwrap());
    assert!(peer.is_connected());

    let rx = peer
        .send_async(
            OperationRequest::new(1, Bytes::from_static(b"hello")),
            SendParameters::immediate(),
            None,
        )
        .unwrap();
    let response = pump(&peer, &rx);
    assert_eq!(response.return_code, ReturnCode::Ok);
    assert_eq!(response.payload.as_ref(), b"hello");
    assert!(peer.average_rtt().is_some());

    // Delayed queue goes out through the rate-limited path
    let rx = peer
        .send_async(
            OperationRequest::new(42, Bytes::new()),
            SendParameters::default(),
            None,
        )
        .unwrap();
    assert_eq!(pump(&peer, &rx).return_code, ReturnCode::OperationNotFound);
    assert_eq!(peer.queued_count(), 0);

    peer.disconnect();
    assert!(!peer.is_connected());
    server.stop();
}

#[test]
fn test_server_events_reach_handler() {
    let server = TcpServer::new(server_settings("peer-events"), Arc::new(service())).unwrap();
    server.start().unwrap();
    let peer = peer(server.local_addr().unwrap());

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    peer.set_event_handler(move |event: &OperationEvent| {
        seen.lock().unwrap().push((event.event_code, event.payload.clone()));
    });

    let rx = peer
        .send_async(OperationRequest::new(2, Bytes::new()), SendParameters::immediate(), None)
        .unwrap();
    assert!(pump(&peer, &rx).is_ok());

    // The event was written before the response on the same stream
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], (9, Bytes::from_static(b"news")));
    server.stop();
}

#[test]
fn test_request_timeout() {
    let server = TcpServer::new(server_settings("peer-timeout"), Arc::new(service())).unwrap();
    server.start().unwrap();
    let peer = peer(server.local_addr().unwrap());

    let rx = peer
        .send_async(
            OperationRequest::new(3, Bytes::new()),
            SendParameters::immediate(),
            Some(Duration::from_millis(50)),
        )
        .unwrap();
    let response = pump(&peer, &rx);
    assert_eq!(response.return_code, ReturnCode::OperationTimeout);
    assert!(response.debug_message.is_some());

    // The late real response is dropped without a second callback
    thread::sleep(Duration::from_millis(400));
    peer.service();
    assert!(rx.try_recv().is_err());
    server.stop();
}

#[test]
fn test_session_rate_limit_rejects() {
    let settings = ServerSettings {
        max_session_request_per_second: 1,
        ..server_settings("peer-rate")
    };
    let server = TcpServer::new(settings, Arc::new(service())).unwrap();
    server.start().unwrap();
    let peer = peer(server.local_addr().unwrap());

    let first = peer
        .send_async(OperationRequest::new(1, Bytes::new()), SendParameters::immediate(), None)
        .unwrap();
    let second = peer
        .send_async(OperationRequest::new(1, Bytes::new()), SendParameters::immediate(), None)
        .unwrap();

    assert_eq!(pump(&peer, &first).return_code, ReturnCode::Ok);
    assert_eq!(pump(&peer, &second).return_code, ReturnCode::MaxRequestPerSecond);
    server.stop();
}

#[test]
fn test_operations_over_udp() {
    let server = UdpServer::new(server_settings("peer-udp"), Arc::new(service())).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut request = OperationRequest::new(1, Bytes::from_static(b"datagram"));
    request.request_id = 5;
    socket
        .send_to(&codec::encode(&Message::Request(request)), addr)
        .unwrap();

    let mut buf = [0u8; 1500];
    let (n, _) = socket.recv_from(&mut buf).unwrap();
    match codec::decode_frame(&buf[..n]).unwrap() {
        Message::Response(response) => {
            assert_eq!(response.request_id, 5);
            assert_eq!(response.payload.as_ref(), b"datagram");
        }
        other => panic!("expected a response, got {:?}", other),
    }

    let stats = server.network_statistics();
    assert_eq!(stats.sessions_connected(), 1);
    server.stop();
}
