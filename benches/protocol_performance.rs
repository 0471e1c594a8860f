//! Protocol performance benchmarks
//!
//! - HTTP request parsing, whole and trickled in small chunks
//! - WebSocket frame encoding and incremental decoding
//! - Operation message codec
//! - Request admission gates
//!
//! Run with: cargo bench --bench protocol_performance

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protonnet::http::HttpRequest;
use protonnet::peer::codec::{self, FrameReader, Message};
use protonnet::peer::OperationRequest;
use protonnet::server::{RequestAdmission, SessionId};
use protonnet::ws::{Opcode, WebSocket, WsHandler};
use std::time::Duration;

const REQUEST: &[u8] = b"POST /api/v1/players/42/inventory?expand=items HTTP/1.1\r\n\
Host: game.example.com\r\n\
User-Agent: protonnet-bench/1.0\r\n\
Accept: application/json\r\n\
Content-Type: application/json\r\n\
Cookie: session=abc123; region=eu\r\n\
Content-Length: 27\r\n\
\r\n\
{\"item\":\"sword\",\"count\":1}\n";

fn parse(request: &mut HttpRequest, chunk: &[u8]) -> bool {
    let mut body = chunk;
    if request.is_pending_header() {
        request.set_header_buffer(chunk);
        body = &[];
    }
    request.is_pending_body() && request.set_body_buffer(body)
}

// ========== HTTP ==========

fn bench_http_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("http_parse");
    group.throughput(Throughput::Bytes(REQUEST.len() as u64));

    for chunk_size in [REQUEST.len(), 64, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk_size), &chunk_size, |b, &size| {
            b.iter(|| {
                let mut request = HttpRequest::new();
                let mut complete = false;
                for chunk in REQUEST.chunks(size) {
                    complete = parse(&mut request, black_box(chunk));
                }
                assert!(complete);
                black_box(request.body_length());
            });
        });
    }

    group.finish();
}

fn bench_http_compose(c: &mut Criterion) {
    c.bench_function("http_compose_post", |b| {
        let mut request = HttpRequest::new();
        b.iter(|| {
            request
                .set_begin("POST", "/api/v1/players/42/inventory")
                .set_header("Host", "game.example.com")
                .set_header("Content-Type", "application/json")
                .set_body(black_box(&b"{\"item\":\"sword\",\"count\":1}"[..]));
            black_box(request.cache().len());
        });
    });
}

// ========== WebSocket ==========

#[derive(Default)]
struct Count {
    bytes: usize,
}

impl WsHandler for Count {
    fn on_ws_received(&mut self, data: &[u8]) {
        self.bytes += data.len();
    }
}

fn bench_ws_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("ws_encode");

    for size in [16usize, 1024, 65536] {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("masked", size), &payload, |b, payload| {
            let mut engine = WebSocket::client();
            b.iter(|| black_box(engine.prepare_message(Opcode::Binary, payload).len()));
        });
        group.bench_with_input(BenchmarkId::new("unmasked", size), &payload, |b, payload| {
            let mut engine = WebSocket::server();
            b.iter(|| black_box(engine.prepare_message(Opcode::Binary, payload).len()));
        });
    }

    group.finish();
}

fn bench_ws_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("ws_decode");

    for size in [16usize, 1024, 65536] {
        let mut client = WebSocket::client();
        let frame = client.prepare_message(Opcode::Binary, &vec![0xA5u8; size]).to_vec();
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("whole", size), &frame, |b, frame| {
            let mut server = WebSocket::server();
            let mut count = Count::default();
            b.iter(|| {
                server.prepare_receive_frame(black_box(frame), &mut count);
            });
        });
        group.bench_with_input(BenchmarkId::new("chunked_512", size), &frame, |b, frame| {
            let mut server = WebSocket::server();
            let mut count = Count::default();
            b.iter(|| {
                for chunk in frame.chunks(512) {
                    server.prepare_receive_frame(black_box(chunk), &mut count);
                }
            });
        });
    }

    group.finish();
}

// ========== Operations ==========

fn bench_operation_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("operation_codec");
    let mut request = OperationRequest::new(7, Bytes::from(vec![1u8; 256]));
    request.request_id = 1234;
    let message = Message::Request(request);
    let frame = codec::encode(&message);
    group.throughput(Throughput::Bytes(frame.len() as u64));

    group.bench_function("encode", |b| b.iter(|| black_box(codec::encode(black_box(&message)))));
    group.bench_function("decode_frame", |b| {
        b.iter(|| black_box(codec::decode_frame(black_box(&frame)).is_ok()))
    });
    group.bench_function("frame_reader_100", |b| {
        let stream: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * 100).collect();
        b.iter(|| {
            let mut reader = FrameReader::new(1 << 20);
            let mut count = 0;
            for chunk in stream.chunks(1400) {
                reader.push(chunk);
                while let Ok(Some(_)) = reader.next_message() {
                    count += 1;
                }
            }
            assert_eq!(count, 100);
        });
    });

    group.finish();
}

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");

    group.bench_function("unlimited", |b| {
        let admission = RequestAdmission::new(0, 0, 0);
        b.iter(|| black_box(admission.try_admit(SessionId(1)).is_ok()));
    });
    group.bench_function("all_gates_1000_sessions", |b| {
        let admission = RequestAdmission::new(100_000, 100, usize::MAX >> 1);
        let mut session = 0u64;
        b.iter(|| {
            session = (session + 1) % 1000;
            black_box(admission.try_admit(SessionId(session)).is_ok())
        });
    });

    group.finish();
}

criterion_group! {
    name = parsing;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(500);
    targets = bench_http_parse, bench_http_compose
}

criterion_group! {
    name = websocket;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(500);
    targets = bench_ws_encode, bench_ws_decode
}

criterion_group! {
    name = operations;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5));
    targets = bench_operation_codec, bench_admission
}

criterion_main!(parsing, websocket, operations);
