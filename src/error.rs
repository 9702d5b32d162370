//! 에러 타입 정의

use thiserror::Error;

use crate::endpoint::EndpointState;

/// sockloop 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    /// 소켓 I/O 실패 (accept/receive/read/write)
    #[error("네트워크 IO 에러: {0}")]
    Io(#[from] std::io::Error),

    /// 빌더 설정 검증 실패
    #[error("설정 에러: {0}")]
    Config(String),

    #[error("잘못된 엔드포인트 상태: expected {expected:?}, got {got:?}")]
    InvalidState {
        expected: EndpointState,
        got: EndpointState,
    },

    /// 사용자 핸들러가 반환한 에러
    #[error("핸들러 에러: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),

    #[error("프레임 크기 초과: size={size}, max={max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("워커 풀 종료됨")]
    PoolShutdown,

    #[error("알 수 없는 에러: {0}")]
    Unknown(String),
}

impl Error {
    /// 핸들러 에러 생성
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Handler(err.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
