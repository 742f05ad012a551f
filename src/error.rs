//! 에러 타입 정의

use thiserror::Error;

use crate::session::Stage;
use crate::transport::ServiceCode;

/// 클라이언트 세션 에러 타입
///
/// 모든 에러는 치명적이다. 세션은 폐기되고 종료 플래그가 설정되며 재시도는 없다.
#[derive(Error, Debug)]
pub enum Error {
    #[error("연결 실패: 유효하지 않은 핸들")]
    ConnectFailure,

    #[error("프로토콜 위반 ({stage:?}): {detail}")]
    ProtocolViolation { stage: Stage, detail: String },

    #[error("전송 계층 에러 통지 ({stage:?}): {code:?}, value={value}")]
    Notified {
        stage: Stage,
        code: ServiceCode,
        value: i32,
    },

    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("전송 실패 ({stage:?}): code={code}")]
    SendFailure { stage: Stage, code: i32 },

    #[error("정상 종료 실패: code={code}")]
    ShutdownFailure { code: i32 },

    #[error("공유 키 설치 실패: code={code}")]
    KeyInstallFailure { code: i32 },

    #[error("전송 계층이 {operation} 요청을 거부: code={code}")]
    IssueFailure { operation: &'static str, code: i32 },

    #[error("유효하지 않은 파일 이름: {0}")]
    InvalidFileName(String),

    #[error("단계 타임아웃: {stage:?}")]
    Timeout { stage: Stage },

    #[error("세션 취소됨")]
    Cancelled,

    #[error("세션 태스크 실패: {0}")]
    TaskFailed(String),
}

impl Error {
    pub(crate) fn violation(stage: Stage, detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            stage,
            detail: detail.into(),
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
