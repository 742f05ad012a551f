//! 환영 메시지 파싱
//!
//! 레이아웃: `<UTF-8 메시지> 0x00 <상대방 공개키 32 bytes>`
//! 공개키가 정확히 32 bytes가 아니면 키 교환을 건너뛴다.

use crate::{KEY_SIZE, MAX_WELCOME_SIZE};

/// 연결 시 상대방이 보낸 환영 메시지
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Welcome {
    /// 종료 문자 앞의 사람이 읽을 메시지
    pub message: Option<String>,

    /// 종료 문자 뒤에 붙은 상대방 공개키
    pub peer_key: Option<[u8; KEY_SIZE]>,

    /// 종료 문자 뒤의 바이트 수 (키 크기 불일치 진단용)
    pub trailing_len: usize,
}

impl Welcome {
    /// 선언된 길이 `declared_len`으로 환영 메시지 파싱
    ///
    /// 선언 길이는 실제 버퍼 길이와 최대 크기로 제한된다.
    pub fn parse(payload: &[u8], declared_len: i32) -> Self {
        if declared_len <= 0 {
            return Self::default();
        }

        let len = (declared_len as usize).min(payload.len()).min(MAX_WELCOME_SIZE);
        let payload = &payload[..len];

        let Some(zero) = payload.iter().position(|&b| b == 0) else {
            return Self::default();
        };

        // 종료 문자 포함 메시지 길이
        let message_len = zero + 1;
        let message = Some(String::from_utf8_lossy(&payload[..zero]).into_owned());

        if message_len >= len {
            return Self {
                message,
                ..Self::default()
            };
        }

        let trailing = &payload[message_len..];
        let peer_key = <[u8; KEY_SIZE]>::try_from(trailing).ok();

        Self {
            message,
            peer_key,
            trailing_len: trailing.len(),
        }
    }

    /// 키 교환 진행 여부
    pub fn offers_key(&self) -> bool {
        self.peer_key.is_some()
    }
}

/// 환영 메시지 생성 (상대방 측 / 테스트용)
pub fn build_welcome(message: &str, peer_key: Option<&[u8; KEY_SIZE]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 1 + KEY_SIZE);
    out.extend_from_slice(message.as_bytes());
    out.push(0);
    if let Some(key) = peer_key {
        out.extend_from_slice(key);
    }
    out
}
