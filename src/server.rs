//! TCP 서버
//!
//! ## 동작 방식
//! - accept 스레드: 연결을 받아 채널로 감싸 레지스트리에 등록
//! - 디스패치 스레드: 레지스트리를 계속 돌면서 처리 중이 아닌 채널마다
//!   open 태스크(onOpen) 또는 handle 태스크(읽기 사이클 하나)를 워커 풀에 제출
//! - 채널 하나에는 동시에 태스크 하나만 돈다 (`FlightGuard`)
//! - 종료 후 accept가 끝나고 레지스트리가 비면 완료 래치 해제

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::buffer::{check_generator, default_generator, BufferGenerator};
use crate::channel::{ChannelId, ChannelSettings, ReadMode, TcpChannel};
use crate::config::TcpServerConfig;
use crate::endpoint::{Endpoint, EndpointState, Latch, SocketConfig, StateCell};
use crate::handler::{require_handlers, ChannelHandler, ChannelLifecycle, NoopLifecycle};
use crate::pool::{require_multi_threaded, WorkerPool};
use crate::stats::{EndpointStats, StatsSnapshot};
use crate::{Error, Result};

/// accept 루프를 깨우는 루프백 연결 타임아웃
const WAKE_TIMEOUT: Duration = Duration::from_millis(200);

/// TCP 서버 빌더
pub struct TcpServerBuilder {
    config: TcpServerConfig,
    generator: BufferGenerator,
    socket_config: Option<SocketConfig>,
    pool: Option<WorkerPool>,
    lifecycle: Arc<dyn ChannelLifecycle>,
    handlers: Vec<Arc<dyn ChannelHandler>>,
}

impl TcpServerBuilder {
    pub fn new() -> Self {
        Self {
            config: TcpServerConfig::default(),
            generator: default_generator(),
            socket_config: None,
            pool: None,
            lifecycle: Arc::new(NoopLifecycle),
            handlers: Vec::new(),
        }
    }

    /// 설정 전체 교체
    pub fn config(mut self, config: TcpServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn address(mut self, address: IpAddr) -> Self {
        self.config.address = address;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// listen 백로그
    pub fn max_connection(mut self, max_connection: i32) -> Self {
        self.config.max_connection = max_connection;
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

    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.config.dispatch_interval = interval;
        self
    }

    pub fn buffer_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(usize) -> bytes::BytesMut + Send + Sync + 'static,
    {
        self.generator = Arc::new(generator);
        self
    }

    /// 수락한 소켓마다 적용할 설정
    pub fn socket_config<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Socket) -> io::Result<()> + Send + Sync + 'static,
    {
        self.socket_config = Some(Arc::new(hook));
        self
    }

    /// 워커 풀 (필수, 2스레드 이상)
    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
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

    /// 체인 끝에 핸들러 추가
    pub fn handler(mut self, handler: impl ChannelHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: Arc<dyn ChannelHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<TcpServer> {
        self.config.validate()?;
        check_generator(&self.generator, self.config.channel_buffer_size)?;
        let handlers = require_handlers(self.handlers)?;
        let pool = require_multi_threaded(self.pool)?;

        let stats = Arc::new(EndpointStats::new());
        let settings = ChannelSettings {
            buffer_size: self.config.channel_buffer_size,
            read_timeout: self.config.read_timeout,
            read_mode: ReadMode::Poll,
            generator: self.generator,
            stats: stats.clone(),
        };

        Ok(TcpServer {
            inner: Arc::new(ServerInner {
                config: self.config,
                socket_config: self.socket_config,
                settings,
                pool,
                lifecycle: self.lifecycle,
                handlers,
                state: StateCell::new(EndpointState::Created),
                listener: Mutex::new(None),
                local_addr: OnceLock::new(),
                channels: DashMap::new(),
                next_id: AtomicU64::new(1),
                accept_exited: AtomicBool::new(false),
                latch: Latch::new(),
                stats,
            }),
        })
    }
}

impl Default for TcpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    config: TcpServerConfig,
    socket_config: Option<SocketConfig>,
    settings: ChannelSettings,
    pool: WorkerPool,
    lifecycle: Arc<dyn ChannelLifecycle>,
    handlers: Arc<[Arc<dyn ChannelHandler>]>,
    state: StateCell,

    /// 종료 시 깨우기 연결을 보낸 뒤 비운다
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: OnceLock<SocketAddr>,

    /// 살아 있는 채널 레지스트리
    channels: DashMap<ChannelId, Arc<TcpChannel>>,
    next_id: AtomicU64,
    accept_exited: AtomicBool,
    latch: Latch,
    stats: Arc<EndpointStats>,
}

/// TCP 서버 (복제 시 같은 서버를 공유)
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("state", &self.inner.state.get())
            .field("local_addr", &self.inner.local_addr.get())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl TcpServer {
    pub fn builder() -> TcpServerBuilder {
        TcpServerBuilder::new()
    }

    /// bind + listen 후 accept/디스패치 스레드 시작
    ///
    /// `block`이면 서버가 완전히 끝날 때까지 반환하지 않는다.
    pub fn start(&self, block: bool) -> Result<()> {
        let inner = &self.inner;
        inner.state.ensure(EndpointState::Created)?;

        let listener = inner.bind()?;
        let local = listener.local_addr()?;
        inner.state.transition(EndpointState::Created, EndpointState::Opened)?;
        let _ = inner.local_addr.set(local);

        let listener = Arc::new(listener);
        *inner.listener.lock() = Some(listener.clone());

        info!(
            "TCP 서버 시작: {} (workers={}, buffer={})",
            local,
            inner.pool.threads(),
            inner.config.channel_buffer_size
        );

        let acceptor = inner.clone();
        thread::Builder::new()
            .name(format!("sockloop-accept-{}", local.port()))
            .spawn(move || acceptor.accept_loop(listener))?;

        let dispatcher = inner.clone();
        thread::Builder::new()
            .name(format!("sockloop-dispatch-{}", local.port()))
            .spawn(move || dispatcher.dispatch_loop())?;

        if block {
            inner.latch.wait(None);
        }
        Ok(())
    }

    /// 완료 래치 대기 (None이면 무기한). 끝났으면 true
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.inner.latch.wait(timeout)
    }

    /// 리슨 소켓 (열려 있는 동안만)
    pub fn source(&self) -> Option<Arc<TcpListener>> {
        self.inner.listener.lock().clone()
    }

    /// 현재 레지스트리의 채널 목록
    pub fn channels(&self) -> Vec<Arc<TcpChannel>> {
        self.inner
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<TcpChannel>> {
        self.inner.channels.get(&id).map(|entry| entry.value().clone())
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &TcpServerConfig {
        &self.inner.config
    }
}

impl ServerInner {
    fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::new(self.config.address, self.config.port);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.max_connection)?;
        Ok(socket.into())
    }

    fn is_opened(&self) -> bool {
        self.state.get() == EndpointState::Opened
    }

    // ─────────────────────────────────────────────────────────────────
    // accept
    // ─────────────────────────────────────────────────────────────────

    fn accept_loop(self: Arc<Self>, listener: Arc<TcpListener>) {
        debug!("accept 루프 시작");

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if !self.is_opened() {
                        trace!("종료 중 수락된 연결 버림: {}", peer);
                        break;
                    }
                    if let Err(e) = self.register(stream) {
                        warn!("채널 등록 실패 ({}): {}", peer, e);
                        self.stats.record_transport_error();
                        self.lifecycle.on_exception(None, &Bytes::new(), &e);
                    }
                }
                Err(e) => {
                    if !self.is_opened() {
                        break;
                    }
                    warn!("accept 에러: {}", e);
                    self.stats.record_transport_error();
                    self.lifecycle.on_exception(None, &Bytes::new(), &Error::Io(e));
                    thread::sleep(self.config.dispatch_interval);
                }
            }
        }

        drop(listener);
        self.accept_exited.store(true, Ordering::Release);
        debug!("accept 루프 종료");
    }

    fn register(&self, stream: TcpStream) -> Result<()> {
        if let Some(hook) = &self.socket_config {
            let socket = SockRef::from(&stream);
            hook(&*socket)?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(TcpChannel::new(id, stream, self.settings.clone())?);
        trace!(channel = id, remote = %channel.remote_addr(), "연결 수락");
        self.channels.insert(id, channel.clone());

        // 레지스트리 정리와 엇갈린 경우
        if !self.is_opened() {
            let _ = channel.close_now();
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // 디스패치
    // ─────────────────────────────────────────────────────────────────

    fn dispatch_loop(self: Arc<Self>) {
        debug!("디스패치 루프 시작");

        loop {
            let snapshot: Vec<Arc<TcpChannel>> = self
                .channels
                .iter()
                .map(|entry| entry.value().clone())
                .collect();

            for channel in snapshot {
                if channel.is_released() {
                    self.channels.remove(&channel.id());
                    continue;
                }
                let Some(guard) = channel.try_lock() else {
                    continue;
                };

                if self.pool.is_shutdown() {
                    // 풀이 닫혔으면 여기서 직접 정리
                    guard.announce(&*self.lifecycle);
                    guard.teardown(&*self.lifecycle);
                    continue;
                }

                let open = !guard.is_announced();
                let inner = self.clone();
                let submitted = self.pool.execute(move || {
                    if open {
                        guard.announce(&*inner.lifecycle);
                    } else {
                        guard.handle_cycle(&inner.handlers, &*inner.lifecycle);
                    }
                });
                if let Err(e) = submitted {
                    trace!(channel = channel.id(), "태스크 제출 실패: {}", e);
                }
            }

            if self.is_drained() {
                break;
            }
            thread::sleep(self.config.dispatch_interval);
        }

        info!("TCP 서버 종료 완료: {}", self.stats.snapshot().summary());
        self.latch.release();
    }

    fn is_drained(&self) -> bool {
        self.accept_exited.load(Ordering::Acquire) && self.channels.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────
    // 종료
    // ─────────────────────────────────────────────────────────────────

    /// 상태를 닫고 accept를 깨운 뒤 모든 채널을 양방향 종료
    fn shut_sockets(&self) -> Result<()> {
        let state = self.state.get();
        if state == EndpointState::Created {
            return Err(Error::InvalidState {
                expected: EndpointState::Opened,
                got: state,
            });
        }
        if !self.state.close() {
            return Ok(());
        }

        info!("TCP 서버 종료 요청 (채널 {}개)", self.channels.len());
        self.wake_acceptor();

        let live: Vec<Arc<TcpChannel>> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in live {
            if let Err(e) = channel.close_now() {
                debug!(channel = channel.id(), "채널 종료 에러: {}", e);
            }
        }
        Ok(())
    }

    /// 블로킹 accept는 다른 스레드에서 닫을 수 없으므로 연결 하나를 넣어 깨운다
    fn wake_acceptor(&self) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        let mut addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("리슨 주소 조회 실패: {}", e);
                return;
            }
        };
        if addr.ip().is_unspecified() {
            let loopback = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
        }

        if let Err(e) = TcpStream::connect_timeout(&addr, WAKE_TIMEOUT) {
            warn!("accept 루프 깨우기 실패: {}", e);
        }
    }
}

impl Endpoint for TcpServer {
    fn state(&self) -> EndpointState {
        self.inner.state.get()
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        self.inner.state.ensure(EndpointState::Opened)?;
        self.inner
            .local_addr
            .get()
            .copied()
            .ok_or_else(|| Error::Unknown("바인드 주소 없음".to_string()))
    }

    /// 새 연결을 막고 모든 채널을 닫은 뒤 정리가 끝날 때까지 대기
    fn close(&self, timeout: Option<Duration>) -> Result<bool> {
        self.inner.shut_sockets()?;
        Ok(self.inner.latch.wait(timeout))
    }

    /// 소켓을 닫고 워커 풀도 종료한다. 남은 채널은 디스패치 스레드가 정리
    fn close_now(&self) -> Result<()> {
        self.inner.shut_sockets()?;
        self.inner.pool.shutdown();
        Ok(())
    }
}
