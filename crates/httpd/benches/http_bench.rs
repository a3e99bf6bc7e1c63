use std::fs;
use std::hint::black_box;
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, Instant};

use criterion::{Criterion, criterion_group, criterion_main};
use micro_httpd::buffer::Buffer;
use micro_httpd::protocol::{HttpRequest, HttpResponse};
use micro_httpd::timer::HeapTimer;
use micro_httpd::user::MemoryUserDb;

const GET_REQUEST: &[u8] = b"GET /index HTTP/1.1\r\nHost: localhost\r\nUser-Agent: bench\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n";
const LOGIN_REQUEST: &[u8] = b"POST /login.html HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\nConnection: keep-alive\r\n\r\nusername=alice&password=secret";

fn bench_buffer(c: &mut Criterion) {
    let payload = vec![b'x'; 128 * 1024];

    c.bench_function("buffer_read_write_128k", |b| {
        let mut buffer = Buffer::new();
        let mut sink = Vec::with_capacity(payload.len());
        b.iter(|| {
            let mut source = Cursor::new(&payload[..]);
            while buffer.read_from(&mut source).unwrap() > 0 {}
            sink.clear();
            black_box(buffer.write_to(&mut sink).unwrap());
        });
    });
}

fn bench_request_parse(c: &mut Criterion) {
    let pool = MemoryUserDb::with_users([("alice", "secret")]).pool(1).unwrap();

    c.bench_function("parse_get_request", |b| {
        let mut request = HttpRequest::new();
        let mut buffer = Buffer::new();
        b.iter(|| {
            request.init();
            buffer.append(GET_REQUEST);
            black_box(request.parse(&mut buffer, None).unwrap());
        });
    });

    c.bench_function("parse_login_form", |b| {
        let mut request = HttpRequest::new();
        let mut buffer = Buffer::new();
        b.iter(|| {
            request.init();
            buffer.append(LOGIN_REQUEST);
            black_box(request.parse(&mut buffer, Some(&pool)).unwrap());
        });
    });
}

fn bench_response_build(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let index = dir.path().join("index.html");
    fs::write(&index, vec![b'a'; 16 * 1024]).unwrap();
    fs::set_permissions(&index, fs::Permissions::from_mode(0o644)).unwrap();

    c.bench_function("build_file_response", |b| {
        let mut response = HttpResponse::new();
        let mut buffer = Buffer::new();
        b.iter(|| {
            response.init(dir.path(), "/index.html", true, None);
            response.make_response(&mut buffer).unwrap();
            black_box(response.file_len());
            buffer.retrieve_all();
        });
    });
}

fn bench_timer(c: &mut Criterion) {
    c.bench_function("timer_add_adjust_tick_1k", |b| {
        let now = Instant::now();
        b.iter(|| {
            let mut timer = HeapTimer::new();
            for id in 0..1000 {
                timer.add_at(id, now, Duration::from_millis(u64::from(id.unsigned_abs() % 97)), Box::new(|| {}));
            }
            for id in (0..1000).step_by(3) {
                timer.adjust_at(id, now, Duration::from_millis(200));
            }
            black_box(timer.tick_at(now + Duration::from_millis(100)));
        });
    });
}

criterion_group!(benches, bench_buffer, bench_request_parse, bench_response_build, bench_timer);
criterion_main!(benches);
