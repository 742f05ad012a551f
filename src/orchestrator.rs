//! 세션 오케스트레이터
//!
//! 전송 계층 콜백은 어느 스레드에서든 호출될 수 있으므로, 모든 콜백은 인자를
//! 소유 이벤트로 복사해 하나의 채널에 넣기만 한다. 세션 상태는 이 모듈의
//! 단일 태스크만 접근하며 `(단계, 이벤트)` 쌍으로 다음 연산을 결정한다.
//!
//! ```text
//! Connecting -> [KeyExchange] -> AwaitName -> ReceivingContent
//!            -> Acknowledging -> ShuttingDown -> Closed
//! ```
//!
//! 어느 단계에서든 에러는 치명적이다: 폐기, 종료 플래그 설정, 재시도 없음.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::crypto::{KeyAgreement, KeyMaterial};
use crate::name::{name_buffer, ReceivedName};
use crate::session::{Session, Stage};
use crate::stats::ReceiveStats;
use crate::transport::{
    ChunkFn, EndOfMessage, Handle, NotifyOnce, ServiceCode, SessionParameters, Transport,
};
use crate::welcome::Welcome;
use crate::{Error, Result, ACK_PAYLOAD, MAX_WELCOME_SIZE};

/// 에러 콜백이 등록된 시점
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    /// 연결 시 등록한 콜백
    Initial,
    /// 공유 키 설치 후 재지정한 콜백
    Secured,
}

/// 전송 계층 콜백이 만든 이벤트
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Connected {
        handle: Option<Handle>,
        welcome: Bytes,
        len: i32,
    },
    TransportError {
        phase: ErrorPhase,
        code: ServiceCode,
        value: i32,
    },
    PublicKeySent {
        code: ServiceCode,
        result: i32,
    },
    NameRead {
        code: ServiceCode,
        result: i32,
        buf: BytesMut,
    },
    Chunk {
        data: Bytes,
        len: i32,
        more: bool,
    },
    AckSent {
        code: ServiceCode,
        result: i32,
    },
    ShutdownDone {
        code: ServiceCode,
        result: i32,
    },
}

impl SessionEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "Connected",
            Self::TransportError { .. } => "TransportError",
            Self::PublicKeySent { .. } => "PublicKeySent",
            Self::NameRead { .. } => "NameRead",
            Self::Chunk { .. } => "Chunk",
            Self::AckSent { .. } => "AckSent",
            Self::ShutdownDone { .. } => "ShutdownDone",
        }
    }
}

type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// 이벤트 처리 후 진행 여부
enum Flow {
    Continue,
    Done,
}

/// 세션 하나를 끝까지 구동하는 디스패처
pub(crate) struct Orchestrator {
    session: Session,
    config: ClientConfig,
    agreement: Arc<dyn KeyAgreement>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    stats: ReceiveStats,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        agreement: Arc<dyn KeyAgreement>,
        terminated: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session: Session::new(transport, terminated),
            config,
            agreement,
            events_tx,
            events_rx,
            stats: ReceiveStats::new(),
            cancel,
        }
    }

    /// 연결부터 종료까지 구동
    pub async fn run(mut self, peer: String) -> Result<ReceiveStats> {
        match self.drive(&peer).await {
            Ok(()) => {
                self.stats.finish();
                info!("수신 완료: {}", self.stats.summary());
                Ok(self.stats)
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self, peer: &str) -> Result<()> {
        self.connect(peer)?;

        loop {
            let event = self.next_event().await?;
            if let Flow::Done = self.dispatch(event).await? {
                return Ok(());
            }
        }
    }

    /// 다음 이벤트 대기 (단계 타임아웃 / 취소 포함)
    async fn next_event(&mut self) -> Result<SessionEvent> {
        let stage = self.session.stage();
        let limit = self.config.stage_timeout;
        let cancel = self.cancel.clone();
        let events_rx = &mut self.events_rx;

        let recv = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, events_rx.recv())
                    .await
                    .map_err(|_| Error::Timeout { stage }),
                None => Ok(events_rx.recv().await),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            event = recv => {
                event?.ok_or_else(|| Error::violation(stage, "이벤트 채널 닫힘"))
            }
        }
    }

    /// 단일 디스패치 지점
    async fn dispatch(&mut self, event: SessionEvent) -> Result<Flow> {
        let stage = self.session.stage();
        let kind = event.kind();

        match (stage, event) {
            (_, SessionEvent::TransportError { phase, code, value }) => {
                self.on_transport_error(phase, code, value)
            }
            (Stage::Connecting, SessionEvent::Connected { handle, welcome, len }) => {
                self.on_connected(handle, &welcome, len)?;
                Ok(Flow::Continue)
            }
            (Stage::KeyExchange, SessionEvent::PublicKeySent { code, result }) => {
                self.on_public_key_sent(code, result)?;
                Ok(Flow::Continue)
            }
            (Stage::AwaitName, SessionEvent::NameRead { code, result, buf }) => {
                self.on_name_read(code, result, buf).await?;
                Ok(Flow::Continue)
            }
            (Stage::ReceivingContent, SessionEvent::Chunk { data, len, more }) => {
                self.on_chunk(data, len, more).await?;
                Ok(Flow::Continue)
            }
            (Stage::Acknowledging, SessionEvent::AckSent { code, result }) => {
                self.on_ack_sent(code, result)?;
                Ok(Flow::Continue)
            }
            (Stage::ShuttingDown, SessionEvent::ShutdownDone { code, result }) => {
                self.on_shutdown_done(code, result)?;
                Ok(Flow::Done)
            }
            (stage, _) => Err(Error::violation(stage, format!("예상하지 못한 통지: {kind}"))),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // 콜백 -> 이벤트 변환
    // ═══════════════════════════════════════════════════════════════

    fn notify_once(&self, make: fn(ServiceCode, i32) -> SessionEvent) -> NotifyOnce {
        let tx = self.events_tx.clone();
        Box::new(move |_handle, code, result| {
            let _ = tx.send(make(code, result));
        })
    }

    fn error_callback(&self, phase: ErrorPhase) -> crate::transport::ErrorFn {
        let tx = self.events_tx.clone();
        Arc::new(move |_handle, code, value| {
            let _ = tx.send(SessionEvent::TransportError { phase, code, value });
        })
    }

    /// 스트리밍 콜백: 빌린 청크를 복사해 넘기고 버퍼 회수를 허용한다.
    /// 음수 길이이거나 이미 종료된 세션이면 회수 신호를 보내지 않는다.
    fn chunk_callback(&self) -> ChunkFn {
        let tx = self.events_tx.clone();
        let terminated = self.session.terminal_flag();

        Box::new(move |_handle: Handle, buf: &[u8], len: i32, more: bool| {
            if len < 0 {
                let _ = tx.send(SessionEvent::Chunk {
                    data: Bytes::new(),
                    len,
                    more,
                });
                return false;
            }

            // 회수 여부는 이벤트를 넘기기 전의 종료 상태로 결정
            let reclaim = !terminated.load(Ordering::SeqCst);
            let n = (len as usize).min(buf.len());
            let event = SessionEvent::Chunk {
                data: Bytes::copy_from_slice(&buf[..n]),
                len,
                more,
            };
            tx.send(event).is_ok() && reclaim
        })
    }

    // ═══════════════════════════════════════════════════════════════
    // Connecting
    // ═══════════════════════════════════════════════════════════════

    fn connect(&mut self, peer: &str) -> Result<()> {
        let tx = self.events_tx.clone();
        let params = SessionParameters {
            on_connected: Box::new(move |handle: Option<Handle>, welcome: &[u8], len: i32| {
                let copied = &welcome[..welcome.len().min(MAX_WELCOME_SIZE)];
                let _ = tx.send(SessionEvent::Connected {
                    handle,
                    welcome: Bytes::copy_from_slice(copied),
                    len,
                });
            }),
            on_error: self.error_callback(ErrorPhase::Initial),
            welcome: None,
            flags: 0,
            recv_buffer_size: self.config.recv_buffer_size,
            send_buffer_size: self.config.send_buffer_size,
        };

        info!("Connecting to {}...", peer);
        let handle = self
            .session
            .transport()
            .connect(peer, params)
            .ok_or(Error::ConnectFailure)?;
        self.session.set_handle(handle);
        Ok(())
    }

    fn on_connected(&mut self, handle: Option<Handle>, welcome: &[u8], len: i32) -> Result<()> {
        let notified = handle.ok_or(Error::ConnectFailure)?;
        // 폐기 대상은 항상 connect가 발행한 핸들
        let handle = self.session.require_handle()?;
        if notified != handle {
            warn!("연결 통지 핸들 {}이 발행 핸들 {}과 다름", notified, handle);
            return Err(Error::ConnectFailure);
        }
        info!("Connected, handle = {}", handle);

        let welcome = Welcome::parse(welcome, len);
        if let Some(message) = &welcome.message {
            info!("--- Welcome message from remote peer ---");
            info!(">>> {}", message);
        }
        self.stats.welcome_message = welcome.message.clone();

        match welcome.peer_key {
            Some(peer_key) => self.exchange_keys(handle, peer_key),
            None => {
                if welcome.trailing_len > 0 {
                    warn!(
                        "공개키 크기 불일치 ({} bytes), 키 교환 생략",
                        welcome.trailing_len
                    );
                } else {
                    debug!("상대방 공개키 없음, 키 교환 생략");
                }
                self.request_name(handle)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // KeyExchange
    // ═══════════════════════════════════════════════════════════════

    fn exchange_keys(&mut self, handle: Handle, peer_key: [u8; crate::KEY_SIZE]) -> Result<()> {
        let transport = self.session.transport();

        // 키 재료는 이 함수 안에서만 존재하고 drop 시 소거된다
        let material = KeyMaterial::agree(self.agreement.as_ref(), peer_key);

        let rc = transport.install_key(
            handle,
            material.shared_secret(),
            self.config.key_usage_budget,
            EndOfMessage::NotEnd,
        );
        if rc < 0 {
            return Err(Error::KeyInstallFailure { code: rc });
        }
        self.stats.encrypted = true;
        info!("공유 키 설치 완료");

        let rc = transport.set_error_callback(handle, self.error_callback(ErrorPhase::Secured));
        if rc < 0 {
            warn!("에러 콜백 재지정 실패: rc={}", rc);
        }

        let public_key = Bytes::copy_from_slice(&material.local_public_key());
        drop(material);

        self.session.advance(Stage::KeyExchange);
        info!("To send the key material for shared key agreement...");
        let rc = transport.write(
            handle,
            public_key,
            EndOfMessage::EndOfMessage,
            self.notify_once(|code, result| SessionEvent::PublicKeySent { code, result }),
        );
        if rc < 0 {
            return Err(Error::SendFailure {
                stage: Stage::KeyExchange,
                code: rc,
            });
        }
        Ok(())
    }

    fn on_public_key_sent(&mut self, code: ServiceCode, result: i32) -> Result<()> {
        debug!("공개키 전송 결과: {:?}, {}", code, result);
        if result < 0 {
            return Err(Error::SendFailure {
                stage: Stage::KeyExchange,
                code: result,
            });
        }
        let handle = self.session.require_handle()?;
        self.request_name(handle)
    }

    // ═══════════════════════════════════════════════════════════════
    // AwaitName
    // ═══════════════════════════════════════════════════════════════

    fn request_name(&mut self, handle: Handle) -> Result<()> {
        let tx = self.events_tx.clone();
        self.session.advance(Stage::AwaitName);
        info!("To read the filename...");

        let rc = self.session.transport().read(
            handle,
            name_buffer(),
            Box::new(move |_handle, code, result, buf| {
                let _ = tx.send(SessionEvent::NameRead { code, result, buf });
            }),
        );
        if rc < 0 {
            return Err(Error::IssueFailure {
                operation: "read",
                code: rc,
            });
        }
        Ok(())
    }

    async fn on_name_read(&mut self, code: ServiceCode, result: i32, buf: BytesMut) -> Result<()> {
        if code != ServiceCode::NotifyDataReady || result < 0 {
            return Err(Error::violation(
                Stage::AwaitName,
                format!("이름 읽기 실패: {:?}, result={}", code, result),
            ));
        }

        // 완료 콜백은 FnOnce라 중복 호출은 불가능하다.
        // 길이 0 완료는 기록만 하고 단계 타임아웃에 맡긴다.
        if result == 0 {
            warn!("No filename returned by the peer; still waiting");
            return Ok(());
        }

        let name = ReceivedName::decode(&buf, result as usize)?;
        let path = name.destination(&self.config.recv_dir);
        info!("Remote filename: {} -> {}", name.as_str(), path.display());

        self.stats.file_name = Some(name.as_str().to_owned());
        self.stats.path = Some(path.clone());
        self.session
            .open_sink(path, self.config.overwrite_existing)
            .await?;

        let handle = self.session.require_handle()?;
        self.receive_content(handle)
    }

    // ═══════════════════════════════════════════════════════════════
    // ReceivingContent
    // ═══════════════════════════════════════════════════════════════

    fn receive_content(&mut self, handle: Handle) -> Result<()> {
        self.session.advance(Stage::ReceivingContent);
        info!("To read content with inline buffering...");

        let rc = self
            .session
            .transport()
            .recv_inline(handle, self.chunk_callback());
        if rc < 0 {
            return Err(Error::IssueFailure {
                operation: "recv_inline",
                code: rc,
            });
        }
        Ok(())
    }

    async fn on_chunk(&mut self, data: Bytes, len: i32, more: bool) -> Result<()> {
        if len < 0 {
            return Err(Error::violation(
                Stage::ReceivingContent,
                format!("스트리밍 콜백이 음수 길이 보고: {}", len),
            ));
        }
        if len as usize != data.len() {
            return Err(Error::violation(
                Stage::ReceivingContent,
                format!("보고 길이 {}와 청크 크기 {} 불일치", len, data.len()),
            ));
        }

        if data.is_empty() {
            warn!("Received an empty chunk from the streaming read");
            self.stats.record_empty();
        } else {
            self.session.sink_mut()?.append(&data).await?;
            self.stats.record_chunk(&data);
            debug!(
                "{} bytes written, total {} bytes",
                data.len(),
                self.stats.total_bytes
            );
        }

        if !more {
            let total = self.session.close_sink(self.config.sync_on_close).await?;
            info!("All data have been received ({} bytes), to acknowledge...", total);
            let handle = self.session.require_handle()?;
            self.acknowledge(handle)?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Acknowledging
    // ═══════════════════════════════════════════════════════════════

    fn acknowledge(&mut self, handle: Handle) -> Result<()> {
        self.session.advance(Stage::Acknowledging);
        let rc = self.session.transport().write(
            handle,
            Bytes::from_static(ACK_PAYLOAD),
            EndOfMessage::EndOfMessage,
            self.notify_once(|code, result| SessionEvent::AckSent { code, result }),
        );
        if rc < 0 {
            return Err(Error::SendFailure {
                stage: Stage::Acknowledging,
                code: rc,
            });
        }
        Ok(())
    }

    fn on_ack_sent(&mut self, code: ServiceCode, result: i32) -> Result<()> {
        info!("Result of sending the acknowledgement: {:?}, {}", code, result);
        if result < 0 {
            return Err(Error::SendFailure {
                stage: Stage::Acknowledging,
                code: result,
            });
        }
        let handle = self.session.require_handle()?;
        self.shut_down(handle)
    }

    // ═══════════════════════════════════════════════════════════════
    // ShuttingDown
    // ═══════════════════════════════════════════════════════════════

    fn shut_down(&mut self, handle: Handle) -> Result<()> {
        self.session.advance(Stage::ShuttingDown);
        let rc = self.session.transport().shutdown(
            handle,
            self.notify_once(|code, result| SessionEvent::ShutdownDone { code, result }),
        );
        if rc < 0 {
            error!("Cannot shutdown gracefully in the final stage, rc={}", rc);
            return Err(Error::ShutdownFailure { code: rc });
        }
        Ok(())
    }

    /// 결과와 무관하게 폐기 + 종료
    fn on_shutdown_done(&mut self, code: ServiceCode, result: i32) -> Result<()> {
        info!("Shutdown completed: {:?}, {}", code, result);
        self.session.terminate();
        if result < 0 {
            return Err(Error::ShutdownFailure { code: result });
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // 에러 경로
    // ═══════════════════════════════════════════════════════════════

    fn on_transport_error(
        &mut self,
        phase: ErrorPhase,
        code: ServiceCode,
        value: i32,
    ) -> Result<Flow> {
        let stage = self.session.stage();

        // 정상 종료 중의 완료성 통지는 에러가 아니다
        if stage == Stage::ShuttingDown
            && value >= 0
            && matches!(code, ServiceCode::NotifyFlushed | ServiceCode::NotifyFinish)
        {
            debug!("종료 중 통지 ({:?}): {:?}, {}", phase, code, value);
            return Ok(Flow::Continue);
        }

        warn!("Notify ({:?}): stage={:?}, code={:?}, value={}", phase, stage, code, value);
        Err(Error::Notified { stage, code, value })
    }

    /// 모든 치명적 에러의 단일 처리 경로
    async fn fail(&mut self, err: &Error) {
        error!("세션 실패 ({:?}): {}", self.session.stage(), err);
        self.session.terminate();

        if let Some(mut sink) = self.session.take_sink() {
            if sink.is_closed() {
                return;
            }
            if self.config.discard_partial_on_failure {
                info!("부분 수신 파일 삭제: {}", sink.path().display());
                sink.discard().await;
            } else if let Err(e) = sink.close(false).await {
                warn!("부분 파일 닫기 실패 {}: {}", sink.path().display(), e);
            } else {
                info!(
                    "부분 수신 파일 유지: {} ({} bytes)",
                    sink.path().display(),
                    sink.bytes_written()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::X25519;
    use crate::transport::{LoopbackTransport, PeerScript};

    fn orchestrator() -> (Orchestrator, Arc<AtomicBool>) {
        let transport = Arc::new(LoopbackTransport::new(PeerScript::default()));
        let terminated = Arc::new(AtomicBool::new(false));
        let orchestrator = Orchestrator::new(
            transport,
            ClientConfig::new(),
            Arc::new(X25519),
            terminated.clone(),
            CancellationToken::new(),
        );
        (orchestrator, terminated)
    }

    #[test]
    fn test_chunk_callback_reclaim_signal() {
        let (mut orchestrator, terminated) = orchestrator();
        let mut on_chunk = orchestrator.chunk_callback();
        let handle = Handle::new(1).unwrap();

        // 복사 후 회수 허용
        assert!(on_chunk(handle, &b"abc"[..], 3, true));
        match orchestrator.events_rx.try_recv().unwrap() {
            SessionEvent::Chunk { data, len, more } => {
                assert_eq!(data.as_ref(), b"abc");
                assert_eq!(len, 3);
                assert!(more);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // 음수 길이는 회수 신호 없이 전달만
        let empty: &[u8] = &[];
        assert!(!on_chunk(handle, empty, -1, false));
        assert!(matches!(
            orchestrator.events_rx.try_recv(),
            Ok(SessionEvent::Chunk { len: -1, .. })
        ));

        // 종료 후에는 회수 신호 없음
        terminated.store(true, Ordering::SeqCst);
        assert!(!on_chunk(handle, &b"late"[..], 4, true));
    }

    #[test]
    fn test_chunk_callback_after_session_gone() {
        let (orchestrator, _terminated) = orchestrator();
        let mut on_chunk = orchestrator.chunk_callback();
        drop(orchestrator);

        assert!(!on_chunk(Handle::new(1).unwrap(), &b"abc"[..], 3, true));
    }

    #[test]
    fn test_error_callback_tags_phase() {
        let (mut orchestrator, _terminated) = orchestrator();
        let handle = Handle::new(1).unwrap();

        orchestrator.error_callback(ErrorPhase::Initial)(handle, ServiceCode::NotifyReset, -1);
        orchestrator.error_callback(ErrorPhase::Secured)(handle, ServiceCode::NotifyTimeout, -2);

        assert!(matches!(
            orchestrator.events_rx.try_recv(),
            Ok(SessionEvent::TransportError {
                phase: ErrorPhase::Initial,
                code: ServiceCode::NotifyReset,
                value: -1,
            })
        ));
        assert!(matches!(
            orchestrator.events_rx.try_recv(),
            Ok(SessionEvent::TransportError {
                phase: ErrorPhase::Secured,
                code: ServiceCode::NotifyTimeout,
                value: -2,
            })
        ));
    }

    #[test]
    fn test_shutdown_notices_ignored_only_while_shutting_down() {
        let (mut orchestrator, _terminated) = orchestrator();

        orchestrator.session.advance(Stage::ShuttingDown);
        for code in [ServiceCode::NotifyFlushed, ServiceCode::NotifyFinish] {
            assert!(matches!(
                orchestrator.on_transport_error(ErrorPhase::Initial, code, 0),
                Ok(Flow::Continue)
            ));
        }
        assert!(matches!(
            orchestrator.on_transport_error(ErrorPhase::Initial, ServiceCode::NotifyFlushed, -1),
            Err(Error::Notified { .. })
        ));
        assert!(matches!(
            orchestrator.on_transport_error(ErrorPhase::Secured, ServiceCode::NotifyReset, 0),
            Err(Error::Notified {
                stage: Stage::ShuttingDown,
                ..
            })
        ));

        orchestrator.session.advance(Stage::ReceivingContent);
        assert!(matches!(
            orchestrator.on_transport_error(ErrorPhase::Initial, ServiceCode::NotifyFlushed, 0),
            Err(Error::Notified {
                stage: Stage::ReceivingContent,
                ..
            })
        ));
    }
}
