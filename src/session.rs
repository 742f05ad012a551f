//! 세션 (클라이언트가 시작한 논리 연결 하나)
//!
//! 전송 핸들, 현재 단계, 출력 싱크, 종료 플래그를 소유하며
//! 전송 자원은 정확히 한 번 해제된다.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::sink::Sink;
use crate::transport::{Handle, Transport};
use crate::{Error, Result};

/// 프로토콜 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// 연결 통지 대기
    Connecting,
    /// 공개키 전송 완료 대기
    KeyExchange,
    /// 파일 이름 읽기 대기
    AwaitName,
    /// 파일 내용 스트리밍 수신
    ReceivingContent,
    /// 확인 응답 전송 완료 대기
    Acknowledging,
    /// 정상 종료 완료 대기
    ShuttingDown,
    /// 종료 상태
    Closed,
}

/// 세션 상태
pub struct Session {
    transport: Arc<dyn Transport>,
    handle: Option<Handle>,
    stage: Stage,
    sink: Option<Sink>,
    sink_opened: bool,
    terminated: Arc<AtomicBool>,
    disposed: bool,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, terminated: Arc<AtomicBool>) -> Self {
        Self {
            transport,
            handle: None,
            stage: Stage::Connecting,
            sink: None,
            sink_opened: false,
            terminated,
            disposed: false,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// 전송 계층 콜백과 공유하는 종료 플래그
    pub fn terminal_flag(&self) -> Arc<AtomicBool> {
        self.terminated.clone()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// 다음 단계로 전이
    pub fn advance(&mut self, next: Stage) {
        debug!("단계 전이: {:?} -> {:?}", self.stage, next);
        self.stage = next;
    }

    pub fn set_handle(&mut self, handle: Handle) {
        self.handle = Some(handle);
    }

    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    /// 연산 발행에 필요한 핸들
    pub fn require_handle(&self) -> Result<Handle> {
        self.handle
            .ok_or_else(|| Error::violation(self.stage, "핸들 없이 연산 발행"))
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// 전송 자원 해제 (최대 한 번)
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        if let Some(handle) = self.handle {
            let rc = self.transport.dispose(handle);
            info!("세션 {} 폐기 (rc={})", handle, rc);
        }
        self.disposed = true;
    }

    /// 폐기 + 종료 플래그 설정. 이후 어떤 연산도 발행하지 않는다.
    pub fn terminate(&mut self) {
        self.dispose();
        self.stage = Stage::Closed;
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// 싱크 열기 (세션당 한 번)
    pub async fn open_sink(&mut self, path: PathBuf, overwrite: bool) -> Result<()> {
        if self.sink_opened {
            return Err(Error::violation(self.stage, "싱크를 두 번 열려고 함"));
        }
        self.sink_opened = true;
        self.sink = Some(Sink::open(path, overwrite).await?);
        Ok(())
    }

    pub fn sink_mut(&mut self) -> Result<&mut Sink> {
        let stage = self.stage;
        self.sink
            .as_mut()
            .ok_or_else(|| Error::violation(stage, "열린 싱크 없음"))
    }

    /// 싱크 닫기. 닫힌 싱크는 세션에 남아 쓰기를 거부한다.
    pub async fn close_sink(&mut self, sync: bool) -> Result<u64> {
        let sink = self.sink_mut()?;
        sink.close(sync).await?;
        Ok(sink.bytes_written())
    }

    /// 싱크 회수 (실패 시 부분 파일 정리용)
    pub fn take_sink(&mut self) -> Option<Sink> {
        self.sink.take()
    }

    pub fn bytes_written(&self) -> u64 {
        self.sink.as_ref().map_or(0, Sink::bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackTransport, PeerScript, TransportCall};

    #[test]
    fn test_terminate_disposes_once() {
        let transport = Arc::new(LoopbackTransport::new(PeerScript::default()));
        let flag = Arc::new(AtomicBool::new(false));
        let mut session = Session::new(transport.clone(), flag.clone());
        session.set_handle(Handle::new(7).unwrap());

        session.terminate();
        session.terminate();
        session.dispose();

        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(session.stage(), Stage::Closed);
        let disposals = transport
            .calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::Dispose))
            .count();
        assert_eq!(disposals, 1);
    }

    #[test]
    fn test_terminate_without_handle() {
        let transport = Arc::new(LoopbackTransport::new(PeerScript::default()));
        let mut session = Session::new(transport.clone(), Arc::new(AtomicBool::new(false)));
        session.terminate();
        assert!(session.is_terminated());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sink_opened_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LoopbackTransport::new(PeerScript::default()));
        let mut session = Session::new(transport, Arc::new(AtomicBool::new(false)));

        session.open_sink(dir.path().join("a"), false).await.unwrap();
        assert!(matches!(
            session.open_sink(dir.path().join("b"), false).await,
            Err(Error::ProtocolViolation { .. })
        ));
        assert!(!dir.path().join("b").exists());

        session.sink_mut().unwrap().append(b"abc").await.unwrap();
        assert_eq!(session.close_sink(false).await.unwrap(), 3);
        assert!(session.sink_mut().unwrap().append(b"x").await.is_err());
        assert_eq!(session.bytes_written(), 3);
    }
}
