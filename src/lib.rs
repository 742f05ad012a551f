//! # FileSync Client
//!
//! 비동기 세션 전송 계층 위에서 상대방이 밀어주는 파일 하나를 받는 클라이언트
//!
//! ## 핵심 특징
//! - **통지 기반**: 모든 연산은 발행 후 콜백으로 완료, 블로킹 호출 없음
//! - **단일 디스패치**: 콜백은 이벤트만 만들고 세션 상태는 한 태스크가 소유
//! - **선택적 키 교환**: 환영 메시지에 공개키가 있으면 X25519 공유 키 설치
//! - **스트리밍 수신**: 빌린 청크 버퍼를 복사 후 즉시 반납
//! - **단계별 타임아웃**: 멈춘 상대방 때문에 무한 대기하지 않음
//! - **단일 종료 경로**: 어떤 에러든 폐기 + 종료 플래그, 재시도 없음

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod name;
mod orchestrator;
pub mod session;
pub mod sink;
pub mod stats;
pub mod transport;
pub mod welcome;

pub use client::{FileClient, SessionHandle};
pub use config::ClientConfig;
pub use crypto::{KeyAgreement, KeyMaterial, KeyPair, X25519};
pub use error::{Error, Result};
pub use orchestrator::ErrorPhase;
pub use session::Stage;
pub use stats::ReceiveStats;
pub use transport::{EndOfMessage, Handle, ServiceCode, Transport};

/// 공개키 / 공유 비밀 크기 (바이트)
pub const KEY_SIZE: usize = 32;

/// 파일 이름 버퍼 용량 (바이트)
pub const NAME_BUFFER_SIZE: usize = 256;

/// 환영 메시지 최대 크기 (바이트)
pub const MAX_WELCOME_SIZE: usize = 1024;

/// 수신 완료 확인 응답
pub const ACK_PAYLOAD: &[u8] = b"0000";

/// 공유 키 사용 한도 없음
pub const KEY_USAGE_UNLIMITED: u32 = u32::MAX;

/// 기본 단계 타임아웃 (밀리초)
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 30_000;

