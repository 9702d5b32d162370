//! TCP 서버/클라이언트 통합 테스트

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use sockloop::{
    ChannelHandler, ChannelId, ChannelLifecycle, Endpoint, Error, LengthBasedChannelHandler,
    Message, Result, TcpChannel, TcpClient, TcpServer, TcpServerBuilder, WorkerPool,
};

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn builder(workers: usize) -> TcpServerBuilder {
    TcpServer::builder()
        .address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .worker_pool(WorkerPool::new(workers).unwrap())
}

fn start(server: &TcpServer) -> SocketAddr {
    server.start(false).unwrap();
    server.socket_addr().unwrap()
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// 버퍼 전체를 소비하고 대문자로 돌려준다
struct Upper;

impl ChannelHandler for Upper {
    fn on_message<'a>(
        &self,
        channel: &TcpChannel,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>> {
        if let Some(buf) = message.into_buffer() {
            channel.send(&buf.to_ascii_uppercase())?;
            buf.clear();
        }
        Ok(None)
    }
}

#[test]
fn test_uppercase_echo() {
    let server = builder(2).handler(Upper).build().unwrap();
    let addr = start(&server);

    let mut client = connect(addr);
    client.write_all(b"abc").unwrap();
    let mut reply = [0u8; 3];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ABC");

    assert!(server.close(Some(Duration::from_secs(5))).unwrap());
    let snap = server.stats();
    assert_eq!(snap.bytes_received, 3);
    assert_eq!(snap.bytes_sent, 3);
}

#[test]
fn test_slow_channel_does_not_block_others() {
    /// 큰 입력은 느리게 버리고, 작은 입력은 바로 돌려준다
    struct Mixed;

    impl ChannelHandler for Mixed {
        fn on_message<'a>(
            &self,
            channel: &TcpChannel,
            message: Message<'a>,
        ) -> Result<Option<Message<'a>>> {
            if let Some(buf) = message.into_buffer() {
                if buf.len() <= 16 {
                    channel.send(&buf[..])?;
                } else {
                    thread::sleep(Duration::from_millis(20));
                }
                buf.clear();
            }
            Ok(None)
        }
    }

    let server = builder(4)
        .channel_buffer_size(4096)
        .handler(Mixed)
        .build()
        .unwrap();
    let addr = start(&server);

    let heavy = connect(addr);
    let heavy_writer = thread::spawn(move || {
        let mut heavy = heavy;
        let chunk = vec![7u8; 64 * 1024];
        for _ in 0..16 {
            if heavy.write_all(&chunk).is_err() {
                break;
            }
        }
        heavy
    });

    // 큰 전송이 진행 중인 동안
    thread::sleep(Duration::from_millis(50));
    let mut light = connect(addr);
    let start_time = Instant::now();
    light.write_all(b"z").unwrap();
    let mut reply = [0u8; 1];
    light.read_exact(&mut reply).unwrap();

    assert_eq!(&reply, b"z");
    assert!(start_time.elapsed() < Duration::from_secs(2));

    assert!(server.close(Some(Duration::from_secs(10))).unwrap());
    drop(heavy_writer.join().unwrap());
}

#[test]
fn test_single_flight_per_channel() {
    struct Overlap {
        active: Mutex<HashSet<ChannelId>>,
        overlapped: AtomicBool,
        calls: AtomicUsize,
    }

    impl ChannelHandler for Overlap {
        fn on_message<'a>(
            &self,
            channel: &TcpChannel,
            message: Message<'a>,
        ) -> Result<Option<Message<'a>>> {
            if !self.active.lock().insert(channel.id()) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(3));
            if let Some(buf) = message.into_buffer() {
                buf.clear();
            }
            self.active.lock().remove(&channel.id());
            Ok(None)
        }
    }

    let handler = Arc::new(Overlap {
        active: Mutex::new(HashSet::new()),
        overlapped: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
    });
    let server = builder(4)
        .shared_handler(handler.clone())
        .build()
        .unwrap();
    let addr = start(&server);

    let writers: Vec<_> = (0..3)
        .map(|_| {
            let mut stream = connect(addr);
            thread::spawn(move || {
                for _ in 0..50 {
                    stream.write_all(b"tick").unwrap();
                    thread::sleep(Duration::from_millis(2));
                }
                stream
            })
        })
        .collect();
    let streams: Vec<TcpStream> = writers.into_iter().map(|w| w.join().unwrap()).collect();

    assert!(wait_until(Duration::from_secs(5), || {
        server.stats().bytes_received == 3 * 50 * 4
    }));
    assert!(!handler.overlapped.load(Ordering::SeqCst));
    assert!(handler.calls.load(Ordering::SeqCst) > 3);

    drop(streams);
    assert!(server.close(Some(Duration::from_secs(5))).unwrap());
}

#[test]
fn test_none_short_circuits_chain() {
    struct Swallow;

    impl ChannelHandler for Swallow {
        fn on_message<'a>(
            &self,
            _channel: &TcpChannel,
            message: Message<'a>,
        ) -> Result<Option<Message<'a>>> {
            if let Some(buf) = message.into_buffer() {
                buf.clear();
            }
            Ok(None)
        }
    }

    struct Count(Arc<AtomicUsize>);

    impl ChannelHandler for Count {
        fn on_message<'a>(
            &self,
            _channel: &TcpChannel,
            message: Message<'a>,
        ) -> Result<Option<Message<'a>>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(message))
        }
    }

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let server = builder(2)
        .handler(Count(first.clone()))
        .handler(Swallow)
        .handler(Count(second.clone()))
        .build()
        .unwrap();
    let addr = start(&server);

    let mut client = connect(addr);
    client.write_all(b"hello").unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        first.load(Ordering::SeqCst) > 0
    }));
    assert_eq!(second.load(Ordering::SeqCst), 0);

    drop(client);
    assert!(server.close(Some(Duration::from_secs(5))).unwrap());
}

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl Events {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

struct RecordLifecycle(Arc<Events>);

impl ChannelLifecycle for RecordLifecycle {
    fn on_open(&self, _channel: &TcpChannel) {
        self.0.push("open");
    }

    fn on_close(&self, _channel: &TcpChannel, remainder: &Bytes) {
        self.0.push(format!("close:{}", remainder.len()));
    }

    fn on_exception(&self, _channel: Option<&TcpChannel>, _remainder: &Bytes, error: &Error) {
        self.0.push(format!("error:{}", error));
    }

    fn on_loop(&self, _channel: &TcpChannel, has_data: bool, _backlog: &Bytes) {
        self.0.push(format!("loop:{}", has_data));
    }
}

struct RecordMessage(Arc<Events>);

impl ChannelHandler for RecordMessage {
    fn on_message<'a>(
        &self,
        channel: &TcpChannel,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>> {
        self.0.push("message");
        if let Some(buf) = message.into_buffer() {
            channel.send(&buf[..])?;
            buf.clear();
        }
        Ok(None)
    }
}

#[test]
fn test_lifecycle_order() {
    let events = Arc::new(Events::default());
    let server = builder(2)
        .lifecycle(RecordLifecycle(events.clone()))
        .handler(RecordMessage(events.clone()))
        .build()
        .unwrap();
    let addr = start(&server);

    let mut client = connect(addr);
    client.write_all(b"x").unwrap();
    let mut reply = [0u8; 1];
    client.read_exact(&mut reply).unwrap();
    drop(client);

    assert!(wait_until(Duration::from_secs(5), || {
        events.snapshot().iter().any(|e| e.starts_with("close"))
    }));
    assert!(server.close(Some(Duration::from_secs(5))).unwrap());

    let events = events.snapshot();
    assert_eq!(events.first().map(String::as_str), Some("open"));
    assert_eq!(events.last().map(String::as_str), Some("close:0"));
    assert_eq!(events.iter().filter(|e| e == &"open").count(), 1);
    assert_eq!(events.iter().filter(|e| e.starts_with("close")).count(), 1);

    let message = events.iter().position(|e| e == "message").unwrap();
    let loaded = events.iter().position(|e| e == "loop:true").unwrap();
    assert!(message < loaded);
    assert_eq!(events.iter().filter(|e| e == &"loop:true").count(), 1);
}

#[test]
fn test_loop_reports_new_bytes_per_cycle() {
    let events = Arc::new(Events::default());
    let server = builder(2)
        .lifecycle(RecordLifecycle(events.clone()))
        .handler(RecordMessage(events.clone()))
        .build()
        .unwrap();
    let addr = start(&server);

    let mut client = connect(addr);
    assert!(wait_until(Duration::from_secs(5), || {
        events.snapshot().iter().any(|e| e == "loop:false")
    }));
    for payload in [&b"a"[..], b"b"] {
        client.write_all(payload).unwrap();
        let mut reply = [0u8; 1];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, payload);
    }
    drop(client);

    assert!(server.close(Some(Duration::from_secs(5))).unwrap());
    let events = events.snapshot();
    assert_eq!(events.iter().filter(|e| e == &"loop:true").count(), 2);
    assert_eq!(events[0], "open");
    let last_loop = events.iter().rposition(|e| e.starts_with("loop")).unwrap();
    let close = events.iter().position(|e| e.starts_with("close")).unwrap();
    assert!(last_loop < close);
}

#[cfg(unix)]
#[test]
fn test_idle_connections_do_not_delay_active_one() {
    const IDLE: usize = 100;

    let server = builder(2).handler(Upper).build().unwrap();
    let addr = start(&server);

    let idle: Vec<TcpStream> = (0..IDLE).map(|_| connect(addr)).collect();
    assert!(wait_until(Duration::from_secs(5), || {
        server.stats().channels_opened == IDLE as u64
    }));

    let mut active = connect(addr);
    let mut reply = [0u8; 1];
    active.write_all(b"w").unwrap();
    active.read_exact(&mut reply).unwrap();

    let mut worst = Duration::ZERO;
    for _ in 0..10 {
        let started = Instant::now();
        active.write_all(b"q").unwrap();
        active.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"Q");
        worst = worst.max(started.elapsed());
    }
    assert!(worst < Duration::from_millis(250), "worst echo {:?}", worst);

    drop(idle);
    drop(active);
    assert!(server.close(Some(Duration::from_secs(5))).unwrap());
}

#[test]
fn test_frame_larger_than_channel_buffer_closes_channel() {
    let events = Arc::new(Events::default());
    let server = builder(2)
        .lifecycle(RecordLifecycle(events.clone()))
        .handler(LengthBasedChannelHandler::new(4).unwrap())
        .build()
        .unwrap();
    let addr = start(&server);

    // 기본 채널 버퍼(64KiB)보다 크고 기본 최대 프레임(1MiB)보다 작다
    let frame = LengthBasedChannelHandler::new(4)
        .unwrap()
        .encode(&vec![1u8; 100 * 1024])
        .unwrap();
    let client = connect(addr);
    let writer = thread::spawn(move || {
        let mut client = client;
        let _ = client.write_all(&frame);
        client
    });

    assert!(wait_until(Duration::from_secs(5), || {
        events.snapshot().iter().any(|e| e.starts_with("close"))
    }));
    let events = events.snapshot();
    assert_eq!(events.iter().filter(|e| e.starts_with("error")).count(), 1);
    assert_eq!(server.stats().handler_errors, 1);

    drop(writer.join().unwrap());
    assert!(server.close(Some(Duration::from_secs(5))).unwrap());
}

#[test]
fn test_handler_error_routed_and_channel_survives() {
    struct FailOnBang;

    impl ChannelHandler for FailOnBang {
        fn on_message<'a>(
            &self,
            channel: &TcpChannel,
            message: Message<'a>,
        ) -> Result<Option<Message<'a>>> {
            let Some(buf) = message.into_buffer() else {
                return Ok(None);
            };
            let data = std::mem::take(buf);
            if data.contains(&b'!') {
                return Err(Error::handler("bang"));
            }
            channel.send(&data)?;
            Ok(None)
        }
    }

    let events = Arc::new(Events::default());
    let server = builder(2)
        .lifecycle(RecordLifecycle(events.clone()))
        .handler(FailOnBang)
        .build()
        .unwrap();
    let addr = start(&server);

    let mut client = connect(addr);
    client.write_all(b"!").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        events.snapshot().iter().any(|e| e.starts_with("error"))
    }));

    client.write_all(b"ok").unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ok");
    assert_eq!(server.stats().handler_errors, 1);

    assert!(server.close(Some(Duration::from_secs(5))).unwrap());
}

#[test]
fn test_close_with_zero_timeout_still_completes() {
    struct Slow;

    impl ChannelHandler for Slow {
        fn on_message<'a>(
            &self,
            _channel: &TcpChannel,
            message: Message<'a>,
        ) -> Result<Option<Message<'a>>> {
            thread::sleep(Duration::from_millis(300));
            if let Some(buf) = message.into_buffer() {
                buf.clear();
            }
            Ok(None)
        }
    }

    let server = builder(2).handler(Slow).build().unwrap();
    let addr = start(&server);

    let mut client = connect(addr);
    client.write_all(b"slow").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        server.stats().bytes_received == 4
    }));

    let start_time = Instant::now();
    let _ = server.close(Some(Duration::ZERO)).unwrap();
    assert!(start_time.elapsed() < Duration::from_millis(250));
    assert!(server.is_closed());

    assert!(server.wait(Some(Duration::from_secs(5))));
    assert_eq!(server.channel_count(), 0);
    drop(client);
}

#[test]
fn test_build_errors() {
    assert!(matches!(
        TcpServer::builder().worker_pool(WorkerPool::new(2).unwrap()).build(),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        TcpServer::builder()
            .worker_pool(WorkerPool::new(1).unwrap())
            .handler(Upper)
            .build(),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        builder(2).channel_buffer_size(0).handler(Upper).build(),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        builder(2)
            .buffer_generator(|size| {
                let mut buf = BytesMut::with_capacity(size + 1);
                buf.extend_from_slice(b"!");
                buf
            })
            .handler(Upper)
            .build(),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_partial_frame_carried_across_cycles() {
    struct Collect(Arc<Mutex<Vec<Bytes>>>);

    impl ChannelHandler for Collect {
        fn on_message<'a>(
            &self,
            _channel: &TcpChannel,
            message: Message<'a>,
        ) -> Result<Option<Message<'a>>> {
            if let Some(frame) = message.downcast_ref::<Bytes>() {
                self.0.lock().push(frame.clone());
            }
            Ok(None)
        }
    }

    let frames = Arc::new(Mutex::new(Vec::new()));
    let codec = LengthBasedChannelHandler::new(2).unwrap();
    let encoded = codec.encode(b"split-frame").unwrap();

    let server = builder(2)
        .handler(codec)
        .handler(Collect(frames.clone()))
        .build()
        .unwrap();
    let addr = start(&server);

    let mut client = connect(addr);
    client.write_all(&encoded[..4]).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(frames.lock().is_empty());
    client.write_all(&encoded[4..]).unwrap();

    assert!(wait_until(Duration::from_secs(5), || frames.lock().len() == 1));
    assert_eq!(frames.lock()[0].as_ref(), b"split-frame");

    drop(client);
    assert!(server.close(Some(Duration::from_secs(5))).unwrap());
}

#[test]
fn test_client_and_server_round_trip() {
    /// 값 프레임을 대문자로 되돌려 보낸다
    struct FrameUpper(LengthBasedChannelHandler);

    impl ChannelHandler for FrameUpper {
        fn on_message<'a>(
            &self,
            channel: &TcpChannel,
            message: Message<'a>,
        ) -> Result<Option<Message<'a>>> {
            if let Some(frame) = message.downcast_ref::<Bytes>() {
                channel.send(&self.0.encode(&frame.to_ascii_uppercase())?)?;
            }
            Ok(None)
        }
    }

    struct Greet(Bytes);

    impl ChannelLifecycle for Greet {
        fn on_open(&self, channel: &TcpChannel) {
            channel.send(&self.0).unwrap();
        }
    }

    struct Keep(Arc<Mutex<Option<Bytes>>>);

    impl ChannelHandler for Keep {
        fn on_message<'a>(
            &self,
            channel: &TcpChannel,
            message: Message<'a>,
        ) -> Result<Option<Message<'a>>> {
            if let Some(frame) = message.downcast_ref::<Bytes>() {
                *self.0.lock() = Some(frame.clone());
                channel.close_now()?;
            }
            Ok(None)
        }
    }

    let codec = LengthBasedChannelHandler::new(4).unwrap();
    let server = builder(2)
        .handler(codec.clone())
        .handler(FrameUpper(codec.clone()))
        .build()
        .unwrap();
    let addr = start(&server);

    let reply = Arc::new(Mutex::new(None));
    let client = TcpClient::builder()
        .host_name("127.0.0.1")
        .port(addr.port())
        .lifecycle(Greet(codec.encode(b"round trip").unwrap()))
        .handler(codec)
        .handler(Keep(reply.clone()))
        .build()
        .unwrap();

    client.connect(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(reply.lock().as_deref(), Some(&b"ROUND TRIP"[..]));
    assert!(client.is_closed());

    assert!(server.close(Some(Duration::from_secs(5))).unwrap());
}
