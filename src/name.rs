//! 파일 이름 수신 및 저장 경로 결정

use std::path::{Component, Path, PathBuf};

use bytes::BytesMut;

use crate::session::Stage;
use crate::{Error, Result, NAME_BUFFER_SIZE};

/// 파일 이름 읽기 버퍼 (고정 용량)
pub fn name_buffer() -> BytesMut {
    BytesMut::zeroed(NAME_BUFFER_SIZE)
}

/// 수신된 파일 이름
///
/// 버퍼에는 0으로 끝나는 UTF-8 이름이 들어 있고,
/// 보고된 바이트 수는 종료 문자를 포함한다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedName {
    name: String,
}

impl ReceivedName {
    /// 보고된 바이트 수 `count`로 이름 디코딩 (종료 문자 제외)
    pub fn decode(buf: &[u8], count: usize) -> Result<Self> {
        if count == 0 {
            return Err(Error::violation(Stage::AwaitName, "빈 파일 이름"));
        }
        if count > buf.len() {
            return Err(Error::violation(
                Stage::AwaitName,
                format!("이름 길이 {count}가 버퍼 용량 {}을 초과", buf.len()),
            ));
        }

        let name = std::str::from_utf8(&buf[..count - 1])
            .map_err(|e| Error::InvalidFileName(format!("UTF-8 아님: {e}")))?;
        validate_file_name(name)?;

        Ok(Self {
            name: name.to_owned(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// 수신 디렉터리 + 이름
    pub fn destination(&self, recv_dir: &Path) -> PathBuf {
        recv_dir.join(&self.name)
    }
}

/// 파일 이름 검증
///
/// 수신 디렉터리 밖으로 나가는 이름은 거부한다:
/// 빈 이름, NUL, 경로 구분자, `..`, 절대 경로
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidFileName("빈 이름".into()));
    }
    if name.contains('\0') {
        return Err(Error::InvalidFileName("NUL 문자 포함".into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidFileName(format!("경로 구분자 포함: {name}")));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::InvalidFileName(format!("허용되지 않는 이름: {name}"))),
    }
}
