//! 엔드포인트 공통 계약
//!
//! 서버, 클라이언트, 채널이 공유하는 생명주기 상태와 완료 래치

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::Socket;

use crate::{Error, Result};

/// 원시 소켓 설정 훅
///
/// TCP 서버는 수락한 소켓마다, TCP 클라이언트는 connect 전에,
/// UDP 서버는 bind 전에 호출한다.
pub type SocketConfig = Arc<dyn Fn(&Socket) -> io::Result<()> + Send + Sync>;

/// 엔드포인트 상태
///
/// `Created → Opened → Closed` 한 방향으로만 전이
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EndpointState {
    /// 생성됨 (bind/connect 전)
    Created = 0,

    /// 열림
    Opened = 1,

    /// 닫힘
    Closed = 2,
}

impl EndpointState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EndpointState::Created,
            1 => EndpointState::Opened,
            _ => EndpointState::Closed,
        }
    }
}

/// 원자적 상태 저장소
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: EndpointState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> EndpointState {
        EndpointState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `from`일 때만 `to`로 전이
    pub(crate) fn transition(&self, from: EndpointState, to: EndpointState) -> Result<()> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|got| Error::InvalidState {
                expected: from,
                got: EndpointState::from_u8(got),
            })
    }

    /// Opened → Closed. 이번 호출이 닫았으면 true
    pub(crate) fn close(&self) -> bool {
        self.transition(EndpointState::Opened, EndpointState::Closed)
            .is_ok()
    }

    pub(crate) fn ensure(&self, expected: EndpointState) -> Result<()> {
        let got = self.get();
        if got != expected {
            return Err(Error::InvalidState { expected, got });
        }
        Ok(())
    }
}

/// 완료 래치
///
/// 한 번 해제되면 다시 잠기지 않는다. 유일한 송신자를 drop해서
/// 모든 대기자를 깨운다.
#[derive(Debug, Clone)]
pub(crate) struct Latch {
    release: Arc<Mutex<Option<Sender<()>>>>,
    waiter: Receiver<()>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            release: Arc::new(Mutex::new(Some(tx))),
            waiter: rx,
        }
    }

    pub(crate) fn release(&self) {
        self.release.lock().take();
    }

    pub(crate) fn is_released(&self) -> bool {
        self.release.lock().is_none()
    }

    /// 해제될 때까지 대기 (None이면 무기한). 해제됐으면 true
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.is_released() {
            return true;
        }
        match timeout {
            None => {
                // 송신자가 없어지면 Err로 깨어남
                let _ = self.waiter.recv();
                true
            }
            Some(timeout) => matches!(
                self.waiter.recv_timeout(timeout),
                Err(RecvTimeoutError::Disconnected)
            ),
        }
    }
}

/// 서버, 클라이언트, 채널 공통 생명주기 계약
///
/// 원시 핸들은 타입마다 다르므로 각 타입의 `source()`로 노출한다.
pub trait Endpoint {
    /// 현재 상태
    fn state(&self) -> EndpointState;

    /// 엔드포인트 소켓 주소 (열린 상태에서만)
    fn socket_addr(&self) -> Result<SocketAddr>;

    /// 주소
    fn address(&self) -> Result<IpAddr> {
        self.socket_addr().map(|addr| addr.ip())
    }

    /// 포트
    fn port(&self) -> Result<u16> {
        self.socket_addr().map(|addr| addr.port())
    }

    fn is_opened(&self) -> bool {
        self.state() == EndpointState::Opened
    }

    fn is_closed(&self) -> bool {
        self.state() == EndpointState::Closed
    }

    /// 정상 종료 요청 후 완료 래치를 `timeout`까지 대기 (None이면 무기한)
    ///
    /// 래치가 해제됐으면 `Ok(true)`
    fn close(&self, timeout: Option<Duration>) -> Result<bool>;

    /// 소켓을 닫고 대기 없이 반환
    fn close_now(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::new(EndpointState::Created);
        assert!(!cell.close());
        assert!(cell
            .transition(EndpointState::Created, EndpointState::Opened)
            .is_ok());
        assert!(matches!(
            cell.transition(EndpointState::Created, EndpointState::Opened),
            Err(Error::InvalidState {
                expected: EndpointState::Created,
                got: EndpointState::Opened
            })
        ));
        assert!(cell.close());
        assert!(!cell.close());
        assert_eq!(cell.get(), EndpointState::Closed);
        assert!(cell.ensure(EndpointState::Opened).is_err());
    }

    #[test]
    fn test_latch_timeout_then_release() {
        let latch = Latch::new();
        let start = Instant::now();
        assert!(!latch.wait(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));

        let remote = latch.clone();
        let handle = thread::spawn(move || remote.wait(None));
        thread::sleep(Duration::from_millis(10));
        latch.release();

        assert!(handle.join().unwrap());
        assert!(latch.wait(Some(Duration::ZERO)));
        assert!(latch.is_released());
    }
}
