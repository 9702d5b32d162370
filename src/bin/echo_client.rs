//! 에코 클라이언트
//!
//! 메시지를 줄 단위로 보내고 같은 수의 응답을 받으면 연결을 닫는다.
//!
//! 사용법:
//!   cargo run --release --bin echo-client -- [OPTIONS] [MESSAGE...]
//!
//! 예시:
//!   cargo run --release --bin echo-client -- --port 9000 hello world
//!   cargo run --release --bin echo-client -- --repeat 1000 ping

use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sockloop::{
    ChannelHandler, ChannelLifecycle, DelimiterBasedChannelHandler, Endpoint, Message,
    TcpChannel, TcpClient,
};

/// 클라이언트 실행 옵션
struct ClientOptions {
    host: String,
    port: u16,
    repeat: usize,
    connect_timeout: Duration,
    messages: Vec<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            repeat: 1,
            connect_timeout: Duration::from_secs(5),
            messages: Vec::new(),
        }
    }
}

fn parse_args() -> Result<ClientOptions, Box<dyn StdError>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = ClientOptions::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--host" | "-H", Some(v)) => {
                options.host = v.clone();
                i += 1;
            }
            ("--port" | "-p", Some(v)) => {
                options.port = v.parse()?;
                i += 1;
            }
            ("--repeat" | "-r", Some(v)) => {
                options.repeat = v.parse::<usize>()?.max(1);
                i += 1;
            }
            ("--timeout", Some(v)) => {
                options.connect_timeout = Duration::from_millis(v.parse()?);
                i += 1;
            }
            ("--help" | "-h", _) => {
                println!(
                    r#"sockloop echo client

메시지를 줄 단위로 보내고 응답을 출력한다.

사용법:
  cargo run --release --bin echo-client -- [OPTIONS] [MESSAGE...]

옵션:
  -H, --host <HOST>       서버 호스트 (기본: 127.0.0.1)
  -p, --port <PORT>       서버 포트 (기본: 9000)
  -r, --repeat <N>        메시지 묶음 반복 횟수 (기본: 1)
  --timeout <MS>          연결 타임아웃 밀리초 (기본: 5000)
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            (message, _) => options.messages.push(message.to_string()),
        }
        i += 1;
    }

    if options.messages.is_empty() {
        options.messages.push("hello".to_string());
    }
    Ok(options)
}

/// 열리면 모든 줄을 보낸다
struct SendLines {
    payload: Bytes,
}

impl ChannelLifecycle for SendLines {
    fn on_open(&self, channel: &TcpChannel) {
        info!("연결됨: {}", channel.remote_addr());
        if let Err(e) = channel.send(&self.payload) {
            warn!("송신 실패: {}", e);
            let _ = channel.close_now();
        }
    }

    fn on_exception(
        &self,
        _channel: Option<&TcpChannel>,
        _remainder: &Bytes,
        error: &sockloop::Error,
    ) {
        warn!("에러: {}", error);
    }
}

/// 응답을 출력하고 기대한 수만큼 받으면 닫는다
struct PrintReplies {
    expected: usize,
    received: AtomicUsize,
}

impl ChannelHandler for PrintReplies {
    fn on_message<'a>(
        &self,
        channel: &TcpChannel,
        message: Message<'a>,
    ) -> sockloop::Result<Option<Message<'a>>> {
        if let Some(line) = message.downcast_ref::<Bytes>() {
            let n = self.received.fetch_add(1, Ordering::Relaxed) + 1;
            if self.expected <= 10 || n % (self.expected / 10) == 0 {
                info!("[{}/{}] {}", n, self.expected, String::from_utf8_lossy(line));
            }
            if n >= self.expected {
                channel.close_now()?;
            }
        }
        Ok(None)
    }
}

fn main() -> Result<(), Box<dyn StdError>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = parse_args()?;

    let mut payload = BytesMut::new();
    for _ in 0..options.repeat {
        for message in &options.messages {
            payload.extend_from_slice(message.as_bytes());
            payload.extend_from_slice(b"\n");
        }
    }
    let expected = options.repeat * options.messages.len();

    let replies = Arc::new(PrintReplies {
        expected,
        received: AtomicUsize::new(0),
    });
    let client = TcpClient::builder()
        .host_name(options.host.clone())
        .port(options.port)
        .lifecycle(SendLines {
            payload: payload.freeze(),
        })
        .handler(DelimiterBasedChannelHandler::lines())
        .shared_handler(replies.clone())
        .build()?;

    info!("Connecting to {}:{} ...", options.host, options.port);
    let start = Instant::now();
    client.connect(Some(options.connect_timeout))?;
    let elapsed = start.elapsed();

    let received = replies.received.load(Ordering::Relaxed);
    info!(
        "Received {}/{} replies in {:.3}s",
        received,
        expected,
        elapsed.as_secs_f64()
    );
    info!("{}", client.stats().summary());
    Ok(())
}
