//! 파일 수신 클라이언트
//!
//! 세션 하나를 시작하고 종료될 때까지 기다린다. 대기는 폴링이 아니라
//! 오케스트레이터 태스크의 완료를 기다리는 방식이다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ClientConfig;
use crate::crypto::{KeyAgreement, X25519};
use crate::orchestrator::Orchestrator;
use crate::stats::ReceiveStats;
use crate::transport::Transport;
use crate::{Error, Result};

/// 파일 수신 클라이언트
pub struct FileClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    agreement: Arc<dyn KeyAgreement>,
}

impl FileClient {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            agreement: Arc::new(X25519),
        }
    }

    /// 키 합의 구현 교체
    pub fn with_key_agreement(mut self, agreement: Arc<dyn KeyAgreement>) -> Self {
        self.agreement = agreement;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 세션 시작 (tokio 런타임 안에서 호출)
    pub fn start(&self, peer: &str) -> SessionHandle {
        let terminated = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let orchestrator = Orchestrator::new(
            self.transport.clone(),
            self.config.clone(),
            self.agreement.clone(),
            terminated.clone(),
            cancel.clone(),
        );
        let join = tokio::spawn(orchestrator.run(peer.to_owned()));

        SessionHandle {
            join,
            cancel,
            terminated,
        }
    }

    /// 파일 하나 수신 후 통계 반환
    pub async fn receive(&self, peer: &str) -> Result<ReceiveStats> {
        self.start(peer).wait().await
    }
}

/// 실행 중인 세션 핸들 (외부에서 제어용)
pub struct SessionHandle {
    join: JoinHandle<Result<ReceiveStats>>,
    cancel: CancellationToken,
    terminated: Arc<AtomicBool>,
}

impl SessionHandle {
    /// 세션 종료까지 대기
    pub async fn wait(self) -> Result<ReceiveStats> {
        join_result(self.join.await)
    }

    /// 최대 `limit`만큼 대기, 초과 시 세션 취소
    pub async fn wait_timeout(mut self, limit: Duration) -> Result<ReceiveStats> {
        match tokio::time::timeout(limit, &mut self.join).await {
            Ok(joined) => join_result(joined),
            Err(_) => {
                warn!("세션 대기 시간 초과 ({:?}), 취소", limit);
                self.cancel.cancel();
                join_result(self.join.await)
            }
        }
    }

    /// 세션 취소 (폐기 후 `Error::Cancelled`)
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 종료 플래그
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

fn join_result(
    joined: std::result::Result<Result<ReceiveStats>, tokio::task::JoinError>,
) -> Result<ReceiveStats> {
    joined.unwrap_or_else(|e| Err(Error::TaskFailed(e.to_string())))
}
