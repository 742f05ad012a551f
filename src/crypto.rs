//! 키 합의 모듈 - X25519
//!
//! 흐름:
//! 1. 상대방이 환영 메시지 뒤에 공개키를 붙여 보냄
//! 2. 클라이언트가 키쌍 생성
//! 3. 공유 비밀(shared secret) 계산 후 세션에 설치
//! 4. 클라이언트 공개키 전송
//!
//! 키 재료는 설치 직후 폐기되며 drop 시 0으로 지워진다.

use std::fmt;

use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::KEY_SIZE;

/// 로컬 키쌍 (비밀키는 drop 시 소거)
pub struct KeyPair {
    public: [u8; KEY_SIZE],
    private: Zeroizing<[u8; KEY_SIZE]>,
}

impl KeyPair {
    pub fn new(public: [u8; KEY_SIZE], private: [u8; KEY_SIZE]) -> Self {
        Self {
            public,
            private: Zeroizing::new(private),
        }
    }

    /// 공개키 바이트
    pub fn public_key_bytes(&self) -> [u8; KEY_SIZE] {
        self.public
    }

    pub fn private_key_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.private
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// 키 합의 원시 연산
///
/// 두 연산 모두 순수 함수로 취급한다.
pub trait KeyAgreement: Send + Sync {
    /// 새 키쌍 생성
    fn generate_key_pair(&self) -> KeyPair;

    /// 상대방 공개키와 로컬 비밀키로 공유 비밀 계산
    fn shared_secret(
        &self,
        peer_public: &[u8; KEY_SIZE],
        local_private: &[u8; KEY_SIZE],
    ) -> [u8; KEY_SIZE];
}

/// X25519 기반 기본 구현
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519;

impl KeyAgreement for X25519 {
    fn generate_key_pair(&self) -> KeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        KeyPair::new(*public.as_bytes(), secret.to_bytes())
    }

    fn shared_secret(
        &self,
        peer_public: &[u8; KEY_SIZE],
        local_private: &[u8; KEY_SIZE],
    ) -> [u8; KEY_SIZE] {
        let secret = StaticSecret::from(*local_private);
        let peer_public = PublicKey::from(*peer_public);
        secret.diffie_hellman(&peer_public).to_bytes()
    }
}

/// 키 교환 단계 동안에만 존재하는 키 재료
pub struct KeyMaterial {
    local: KeyPair,
    peer_public: [u8; KEY_SIZE],
    shared: Zeroizing<[u8; KEY_SIZE]>,
}

impl KeyMaterial {
    /// 키쌍 생성 + 공유 비밀 계산
    pub fn agree(agreement: &dyn KeyAgreement, peer_public: [u8; KEY_SIZE]) -> Self {
        let local = agreement.generate_key_pair();
        let shared = agreement.shared_secret(&peer_public, local.private_key_bytes());
        Self {
            local,
            peer_public,
            shared: Zeroizing::new(shared),
        }
    }

    pub fn local_public_key(&self) -> [u8; KEY_SIZE] {
        self.local.public_key_bytes()
    }

    pub fn peer_public_key(&self) -> &[u8; KEY_SIZE] {
        &self.peer_public
    }

    pub fn shared_secret(&self) -> &[u8; KEY_SIZE] {
        &self.shared
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("local_public", &self.local.public)
            .field("peer_public", &self.peer_public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exchange() {
        // 양측이 같은 공유 비밀을 얻어야 함
        let alice = X25519.generate_key_pair();
        let bob = X25519.generate_key_pair();

        let alice_shared = X25519.shared_secret(&bob.public_key_bytes(), alice.private_key_bytes());
        let bob_shared = X25519.shared_secret(&alice.public_key_bytes(), bob.private_key_bytes());

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn test_key_material_agrees_with_peer() {
        let peer = X25519.generate_key_pair();
        let material = KeyMaterial::agree(&X25519, peer.public_key_bytes());

        let peer_shared =
            X25519.shared_secret(&material.local_public_key(), peer.private_key_bytes());
        assert_eq!(material.shared_secret(), &peer_shared);
        assert_eq!(material.peer_public_key(), &peer.public_key_bytes());
    }

    #[test]
    fn test_debug_hides_private_key() {
        let pair = KeyPair::new([1u8; KEY_SIZE], [7u8; KEY_SIZE]);
        let printed = format!("{:?}", pair);
        assert!(printed.contains("public"));
        assert!(!printed.contains("private"));
    }
}
