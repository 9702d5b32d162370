//! 백로그 버퍼 압축
//!
//! 핸들러 체인이 아직 소비하지 않은 바이트(백로그)와 새로 읽은 바이트를
//! 하나의 연속된 읽기 전용 버퍼로 합친다.
//! - 결과는 항상 오프셋 0에서 시작
//! - 남은 바이트는 그대로 다음 사이클로 넘어감 (절대 자르지 않음)

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// 크기 → 버퍼 생성기
///
/// 반환 버퍼는 비어 있어야 하고(len 0) 용량이 요청 크기 이상이어야 한다.
pub type BufferGenerator = Arc<dyn Fn(usize) -> BytesMut + Send + Sync>;

/// 기본 생성기 (`BytesMut::with_capacity`)
pub fn default_generator() -> BufferGenerator {
    Arc::new(BytesMut::with_capacity)
}

/// 생성기 계약 검증 (빌드 시점)
pub fn check_generator(generator: &BufferGenerator, size: usize) -> Result<()> {
    let buf = generator(size);
    if !buf.is_empty() {
        return Err(Error::config(format!(
            "버퍼 생성기가 비어 있지 않은 버퍼를 반환: len={}",
            buf.len()
        )));
    }
    if buf.capacity() < size {
        return Err(Error::config(format!(
            "버퍼 생성기 용량 부족: requested={}, capacity={}",
            size,
            buf.capacity()
        )));
    }
    Ok(())
}

/// 백로그와 새 바이트를 합쳐 새 읽기 전용 버퍼 생성
///
/// - 백로그도 새 바이트도 없음: 할당 없는 빈 버퍼
/// - 새 바이트 없음: 남은 백로그만 정확한 크기로 복사
/// - 새 바이트 있음: 백로그 + 새 바이트 순서로 복사
pub fn compact(
    current: Option<&Bytes>,
    new_bytes: Option<&[u8]>,
    generator: &(dyn Fn(usize) -> BytesMut + Send + Sync),
) -> Bytes {
    let backlog: &[u8] = current.map(|b| b.as_ref()).unwrap_or_default();

    let fresh = match new_bytes {
        Some(fresh) if !fresh.is_empty() => fresh,
        _ => {
            if backlog.is_empty() {
                return Bytes::new();
            }
            return copy_into(generator, backlog.len(), &[backlog]);
        }
    };

    copy_into(generator, backlog.len() + fresh.len(), &[backlog, fresh])
}

fn copy_into(
    generator: &(dyn Fn(usize) -> BytesMut + Send + Sync),
    size: usize,
    parts: &[&[u8]],
) -> Bytes {
    let mut buf = generator(size);
    debug_assert!(buf.is_empty(), "버퍼 생성기는 빈 버퍼를 반환해야 함");
    buf.clear();
    buf.reserve(size);
    for part in parts {
        buf.put_slice(part);
    }
    buf.freeze()
}
