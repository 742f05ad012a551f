//! 클라이언트 설정

use std::path::PathBuf;
use std::time::Duration;

use crate::{DEFAULT_STAGE_TIMEOUT_MS, KEY_USAGE_UNLIMITED};

/// 수신 클라이언트 설정
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 수신 파일을 저장할 디렉터리
    pub recv_dir: PathBuf,

    /// 단계별 대기 타임아웃
    /// None이면 상대방 응답을 무기한 대기
    pub stage_timeout: Option<Duration>,

    /// 같은 이름의 파일이 있으면 덮어쓰기
    /// false면 새 파일만 생성 (이미 있으면 치명적 에러)
    pub overwrite_existing: bool,

    /// 실패 시 부분 수신 파일 삭제
    pub discard_partial_on_failure: bool,

    /// 닫을 때 디스크 동기화 (write-through)
    pub sync_on_close: bool,

    /// 설치할 공유 키의 사용 한도
    pub key_usage_budget: u32,

    /// 전송 계층 수신 버퍼 크기 힌트
    pub recv_buffer_size: usize,

    /// 전송 계층 송신 버퍼 크기 힌트 (0이면 전송 계층 최소값)
    pub send_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            recv_dir: PathBuf::from("."),
            stage_timeout: Some(Duration::from_millis(DEFAULT_STAGE_TIMEOUT_MS)),
            overwrite_existing: false,
            discard_partial_on_failure: false,
            sync_on_close: true,
            key_usage_budget: KEY_USAGE_UNLIMITED,
            recv_buffer_size: 2 * 1024 * 1024, // 2MB
            send_buffer_size: 0,
        }
    }
}

impl ClientConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 수신 디렉터리 지정
    pub fn with_recv_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recv_dir = dir.into();
        self
    }

    /// 단계 타임아웃 지정
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// 느린 상대방용 설정 (타임아웃 없음)
    pub fn patient() -> Self {
        Self {
            stage_timeout: None,
            ..Self::default()
        }
    }

    /// 엄격한 설정 (짧은 타임아웃, 실패 시 부분 파일 삭제)
    pub fn strict() -> Self {
        Self {
            stage_timeout: Some(Duration::from_secs(5)),
            discard_partial_on_failure: true,
            ..Self::default()
        }
    }
}
