//! TCP 클라이언트
//!
//! `connect`를 호출한 스레드가 연결이 끊길 때까지 읽기 사이클을 직접 돈다.
//! 다른 스레드에서 닫으려면 클라이언트를 복제해서 `close`/`close_now`를 호출한다.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::buffer::{check_generator, default_generator, BufferGenerator};
use crate::channel::{ChannelSettings, ReadMode, TcpChannel};
use crate::config::TcpClientConfig;
use crate::endpoint::{Endpoint, EndpointState, Latch, SocketConfig, StateCell};
use crate::handler::{require_handlers, ChannelHandler, ChannelLifecycle, NoopLifecycle};
use crate::stats::{EndpointStats, StatsSnapshot};
use crate::{Error, Result};

/// TCP 클라이언트 빌더
pub struct TcpClientBuilder {
    config: TcpClientConfig,
    generator: BufferGenerator,
    socket_config: Option<SocketConfig>,
    lifecycle: Arc<dyn ChannelLifecycle>,
    handlers: Vec<Arc<dyn ChannelHandler>>,
}

impl TcpClientBuilder {
    pub fn new() -> Self {
        Self {
            config: TcpClientConfig::default(),
            generator: default_generator(),
            socket_config: None,
            lifecycle: Arc::new(NoopLifecycle),
            handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: TcpClientConfig) -> Self {
        self.config = config;
        self
    }

    /// 접속할 호스트 (이름 또는 IP)
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.config.host_name = host_name.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn channel_buffer_size(mut self, size: usize) -> Self {
        self.config.channel_buffer_size = size;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn buffer_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(usize) -> bytes::BytesMut + Send + Sync + 'static,
    {
        self.generator = Arc::new(generator);
        self
    }

    /// connect 전에 적용할 소켓 설정
    pub fn socket_config<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Socket) -> io::Result<()> + Send + Sync + 'static,
    {
        self.socket_config = Some(Arc::new(hook));
        self
    }

    pub fn lifecycle(mut self, lifecycle: impl ChannelLifecycle + 'static) -> Self {
        self.lifecycle = Arc::new(lifecycle);
        self
    }

    pub fn shared_lifecycle(mut self, lifecycle: Arc<dyn ChannelLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn handler(mut self, handler: impl ChannelHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: Arc<dyn ChannelHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<TcpClient> {
        self.config.validate()?;
        check_generator(&self.generator, self.config.channel_buffer_size)?;
        let handlers = require_handlers(self.handlers)?;

        let stats = Arc::new(EndpointStats::new());
        let settings = ChannelSettings {
            buffer_size: self.config.channel_buffer_size,
            read_timeout: self.config.read_timeout,
            read_mode: ReadMode::Blocking,
            generator: self.generator,
            stats: stats.clone(),
        };

        Ok(TcpClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                socket_config: self.socket_config,
                settings,
                lifecycle: self.lifecycle,
                handlers,
                state: StateCell::new(EndpointState::Created),
                channel: Mutex::new(None),
                latch: Latch::new(),
                stats,
            }),
        })
    }
}

impl Default for TcpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientInner {
    config: TcpClientConfig,
    socket_config: Option<SocketConfig>,
    settings: ChannelSettings,
    lifecycle: Arc<dyn ChannelLifecycle>,
    handlers: Arc<[Arc<dyn ChannelHandler>]>,
    state: StateCell,
    channel: Mutex<Option<Arc<TcpChannel>>>,
    latch: Latch,
    stats: Arc<EndpointStats>,
}

/// TCP 클라이언트 (복제 시 같은 연결을 공유)
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("host_name", &self.inner.config.host_name)
            .field("port", &self.inner.config.port)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl TcpClient {
    pub fn builder() -> TcpClientBuilder {
        TcpClientBuilder::new()
    }

    /// 연결 후 연결이 끝날 때까지 읽기 사이클을 돈다
    ///
    /// `timeout`은 연결 수립에만 적용된다 (None이면 OS 기본값).
    /// 반환되면 onClose까지 끝난 상태다.
    pub fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        inner.state.ensure(EndpointState::Created)?;

        let stream = inner.open_stream(timeout)?;
        inner.state.transition(EndpointState::Created, EndpointState::Opened)?;

        let channel = match TcpChannel::new(0, stream, inner.settings.clone()) {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                inner.state.close();
                inner.latch.release();
                return Err(e);
            }
        };
        *inner.channel.lock() = Some(channel.clone());

        // 채널 저장 전에 close가 들어온 경우
        if inner.state.get() == EndpointState::Closed {
            let _ = channel.close_now();
        }
        info!(
            "TCP 클라이언트 연결: {} -> {}",
            channel.local_addr(),
            channel.remote_addr()
        );

        channel.announce(&*inner.lifecycle);
        while channel.handle_cycle(&inner.handlers, &*inner.lifecycle) {}

        inner.state.close();
        info!("TCP 클라이언트 종료: {}", inner.stats.snapshot().summary());
        inner.latch.release();
        Ok(())
    }

    /// 연결된 채널 (connect 이후)
    pub fn channel(&self) -> Option<Arc<TcpChannel>> {
        self.inner.channel.lock().clone()
    }

    /// 채널로 송신
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.channel()
            .ok_or(Error::InvalidState {
                expected: EndpointState::Opened,
                got: self.inner.state.get(),
            })?
            .send(data)
    }

    /// 완료 래치 대기. 끝났으면 true
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.inner.latch.wait(timeout)
    }

    /// 원시 소켓 (connect 이후)
    pub fn source(&self) -> Option<TcpStream> {
        self.channel()
            .and_then(|channel| channel.source().try_clone().ok())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &TcpClientConfig {
        &self.inner.config
    }

    /// 상태를 닫고 채널을 양방향 종료
    fn shut_channel(&self) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state.get();
        if state == EndpointState::Created {
            return Err(Error::InvalidState {
                expected: EndpointState::Opened,
                got: state,
            });
        }
        inner.state.close();

        if let Some(channel) = self.channel() {
            channel.close_now()?;
        }
        Ok(())
    }
}

impl ClientInner {
    /// 이름을 해석해 주소마다 연결을 시도, 처음 성공한 스트림 반환
    fn open_stream(&self, timeout: Option<Duration>) -> Result<TcpStream> {
        let target = (self.config.host_name.as_str(), self.config.port);
        let mut last_err = None;

        for addr in target.to_socket_addrs()? {
            match self.connect_addr(addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("연결 실패 {}: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("주소를 해석할 수 없음: {}", self.config.host_name),
            ))
        }))
    }

    fn connect_addr(&self, addr: SocketAddr, timeout: Option<Duration>) -> Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if let Some(hook) = &self.socket_config {
            hook(&socket)?;
        }

        match timeout {
            Some(timeout) => socket.connect_timeout(&addr.into(), timeout)?,
            None => socket.connect(&addr.into())?,
        }
        Ok(socket.into())
    }
}

impl Endpoint for TcpClient {
    fn state(&self) -> EndpointState {
        self.inner.state.get()
    }

    /// 상대(서버) 주소
    fn socket_addr(&self) -> Result<SocketAddr> {
        self.inner.state.ensure(EndpointState::Opened)?;
        self.channel()
            .map(|channel| channel.remote_addr())
            .ok_or(Error::ConnectionClosed)
    }

    fn close(&self, timeout: Option<Duration>) -> Result<bool> {
        self.shut_channel()?;
        Ok(self.inner.latch.wait(timeout))
    }

    fn close_now(&self) -> Result<()> {
        self.shut_channel()
    }
}
