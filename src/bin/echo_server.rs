//! 에코 서버
//!
//! 줄 단위로 받아 대문자로 바꿔 돌려준다. `--udp`면 데이터그램 단위로 동작.
//!
//! 사용법:
//!   cargo run --release --bin echo-server -- [OPTIONS]
//!
//! 예시:
//!   # TCP 에코 (9000번 포트)
//!   cargo run --release --bin echo-server -- --port 9000
//!
//!   # UDP 에코, 30초 후 종료
//!   cargo run --release --bin echo-server -- --udp --duration 30

use std::error::Error as StdError;
use std::net::{IpAddr, Ipv4Addr};
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sockloop::{
    ChannelHandler, ChannelLifecycle, DelimiterBasedChannelHandler, Endpoint, Message,
    PacketContext, PacketHandler, TcpChannel, TcpServer, UdpServer, WorkerPool,
};

/// 서버 실행 옵션
struct ServerOptions {
    address: IpAddr,
    port: u16,
    udp: bool,
    workers: usize,
    buffer_size: usize,
    duration: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9000,
            udp: false,
            workers: std::thread::available_parallelism()
                .map(|n| n.get().max(2))
                .unwrap_or(4),
            buffer_size: sockloop::DEFAULT_CHANNEL_BUFFER_SIZE,
            duration: None,
        }
    }
}

fn parse_args() -> Result<ServerOptions, Box<dyn StdError>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = ServerOptions::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--address" | "-a", Some(v)) => {
                options.address = v.parse()?;
                i += 1;
            }
            ("--port" | "-p", Some(v)) => {
                options.port = v.parse()?;
                i += 1;
            }
            ("--workers" | "-w", Some(v)) => {
                options.workers = v.parse()?;
                i += 1;
            }
            ("--buffer-size", Some(v)) => {
                options.buffer_size = v.parse()?;
                i += 1;
            }
            ("--duration", Some(v)) => {
                options.duration = Some(Duration::from_secs(v.parse()?));
                i += 1;
            }
            ("--udp" | "-u", _) => options.udp = true,
            ("--help" | "-h", _) => {
                println!(
                    r#"sockloop echo server

받은 줄을 대문자로 바꿔 돌려준다.

사용법:
  cargo run --release --bin echo-server -- [OPTIONS]

옵션:
  -a, --address <IP>      바인드 주소 (기본: 0.0.0.0)
  -p, --port <PORT>       바인드 포트 (기본: 9000)
  -u, --udp               UDP 모드
  -w, --workers <N>       워커 스레드 수 (기본: CPU 코어 수, 최소 2)
  --buffer-size <SIZE>    채널/패킷 버퍼 크기 바이트 (기본: 65536)
  --duration <SECS>       지정한 시간 후 종료 (기본: 무기한)
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            (other, _) => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    Ok(options)
}

fn upper_line(line: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(line.len() + 1);
    out.extend(line.iter().map(u8::to_ascii_uppercase));
    out.extend_from_slice(b"\n");
    out.freeze()
}

/// 디코딩된 줄을 대문자로 돌려준다
struct UpperEcho;

impl ChannelHandler for UpperEcho {
    fn on_message<'a>(
        &self,
        channel: &TcpChannel,
        message: Message<'a>,
    ) -> sockloop::Result<Option<Message<'a>>> {
        if let Some(line) = message.downcast_ref::<Bytes>() {
            channel.send(&upper_line(line))?;
        }
        Ok(None)
    }
}

impl PacketHandler for UpperEcho {
    fn on_packet<'a>(
        &self,
        context: &PacketContext,
        message: Message<'a>,
    ) -> sockloop::Result<Option<Message<'a>>> {
        if let Some(line) = message.downcast_ref::<Bytes>() {
            context.reply(&upper_line(line))?;
        }
        Ok(None)
    }
}

/// 연결 로그
struct ConnectionLog;

impl ChannelLifecycle for ConnectionLog {
    fn on_open(&self, channel: &TcpChannel) {
        info!("연결: {} (channel {})", channel.remote_addr(), channel.id());
    }

    fn on_close(&self, channel: &TcpChannel, remainder: &Bytes) {
        info!(
            "종료: {} (미처리 {} bytes)",
            channel.remote_addr(),
            remainder.len()
        );
    }

    fn on_exception(
        &self,
        channel: Option<&TcpChannel>,
        _remainder: &Bytes,
        error: &sockloop::Error,
    ) {
        match channel {
            Some(channel) => warn!("에러 {}: {}", channel.remote_addr(), error),
            None => warn!("에러: {}", error),
        }
    }
}

fn stop_after<E>(endpoint: E, duration: Option<Duration>)
where
    E: Endpoint + Send + 'static,
{
    let Some(duration) = duration else {
        return;
    };
    thread::spawn(move || {
        thread::sleep(duration);
        info!("실행 시간 종료, 서버를 닫는다");
        if let Err(e) = endpoint.close(Some(Duration::from_secs(5))) {
            warn!("종료 에러: {}", e);
        }
    });
}

fn main() -> Result<(), Box<dyn StdError>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = parse_args()?;
    let pool = WorkerPool::new(options.workers)?;

    info!("sockloop echo server starting...");
    info!("Mode: {}", if options.udp { "UDP" } else { "TCP" });
    info!("Bind address: {}:{}", options.address, options.port);
    info!("Workers: {}", pool.threads());

    if options.udp {
        let server = UdpServer::builder()
            .address(options.address)
            .port(options.port)
            .packet_buffer_size(options.buffer_size)
            .worker_pool(pool)
            .handler(DelimiterBasedChannelHandler::lines())
            .handler(UpperEcho)
            .build()?;
        stop_after(server.clone(), options.duration);
        server.start(true)?;
        info!("{}", server.stats().summary());
    } else {
        let server = TcpServer::builder()
            .address(options.address)
            .port(options.port)
            .channel_buffer_size(options.buffer_size)
            .worker_pool(pool)
            .lifecycle(ConnectionLog)
            .handler(DelimiterBasedChannelHandler::lines())
            .handler(UpperEcho)
            .build()?;
        stop_after(server.clone(), options.duration);
        server.start(true)?;
        info!("{}", server.stats().summary());
    }

    Ok(())
}
