//! 프로세스 내 루프백 전송 계층
//!
//! 파일을 밀어주는 상대방(서버)을 흉내 낸다:
//! 환영 메시지(+공개키) -> 파일 이름 -> 청크 스트림 -> 확인 응답 수신 -> 종료
//!
//! 완료 통지는 별도 스레드에서 호출되어 실제 전송 계층처럼 비동기로 도착한다.
//! 모든 호출은 순서대로 기록되며, 장애 주입으로 각 단계의 실패를 재현할 수 있다.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use super::{
    ChunkFn, EndOfMessage, ErrorFn, Handle, NotifyOnce, ReadDone, ServiceCode, SessionParameters,
    Transport,
};
use crate::crypto::{KeyAgreement, KeyPair, X25519};
use crate::welcome::build_welcome;
use crate::{ACK_PAYLOAD, KEY_SIZE};

/// 장애 주입 지점
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// connect가 유효하지 않은 핸들 반환
    RefuseConnect,
    /// 연결 통지에 핸들 없음
    ConnectNotifiesInvalid,
    /// 연결 통지 핸들이 connect 반환 핸들과 다름
    ConnectNotifiesOtherHandle,
    /// 공유 키 설치 거부
    RejectKeyInstall,
    /// 공개키 전송 완료가 음수 결과
    FailPublicKeySend,
    /// 이름 읽기 완료 코드가 데이터 준비가 아님
    NameNotDataReady,
    /// 이름 읽기가 0 바이트로 완료
    ZeroLengthName,
    /// 이름 읽기가 완료되지 않음
    StallName,
    /// 이름 읽기 대신 에러 콜백으로 리셋 통지
    ResetOnName,
    /// read 요청 거부
    RefuseRead,
    /// recv_inline 요청 거부
    RefuseRecvInline,
    /// n번째 청크 대신 음수 길이 통지
    NegativeChunkAt(usize),
    /// n번째 청크 앞에 빈 청크 삽입
    EmptyChunkAt(usize),
    /// 확인 응답 write 요청 거부
    RejectAckWrite,
    /// 확인 응답 전송 완료가 음수 결과
    FailAckCompletion,
    /// shutdown 요청 거부
    RefuseShutdown,
    /// shutdown 완료가 음수 결과
    FailShutdownCompletion,
    /// shutdown 완료 직전 에러 콜백으로 NotifyFlushed 통지
    FlushNoticeOnShutdown,
}

/// 상대방 동작 스크립트
#[derive(Debug, Clone)]
pub struct PeerScript {
    /// 환영 메시지 텍스트
    pub welcome_message: Option<String>,

    /// 환영 메시지에 공개키 첨부
    pub offer_key: bool,

    /// 원시 환영 메시지 (지정 시 위 두 필드 무시)
    pub raw_welcome: Option<Vec<u8>>,

    /// 보낼 파일 이름 (종료 문자 제외)
    pub file_name: String,

    /// 파일 내용
    pub content: Bytes,

    /// 스트리밍 청크 크기
    pub chunk_size: usize,

    pub faults: Vec<Fault>,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            welcome_message: Some("FileSync loopback peer".into()),
            offer_key: false,
            raw_welcome: None,
            file_name: "received.bin".into(),
            content: Bytes::new(),
            chunk_size: 4096,
            faults: Vec::new(),
        }
    }
}

impl PeerScript {
    pub fn new(file_name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_key(mut self) -> Self {
        self.offer_key = true;
        self
    }

    pub fn with_welcome(mut self, message: Option<&str>) -> Self {
        self.welcome_message = message.map(str::to_owned);
        self
    }

    pub fn with_raw_welcome(mut self, raw: Vec<u8>) -> Self {
        self.raw_welcome = Some(raw);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    fn has(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }
}

/// 기록된 전송 계층 호출
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect { peer: String },
    InstallKey { key: Vec<u8>, budget: u32, eom: EndOfMessage },
    Write { data: Bytes, eom: EndOfMessage },
    Read { capacity: usize },
    RecvInline,
    Shutdown,
    Dispose,
    SetErrorCallback,
}

#[derive(Default)]
struct LoopbackState {
    calls: Vec<TransportCall>,
    disposed: bool,
    calls_after_dispose: usize,
    on_error: Option<ErrorFn>,
    issued: Option<Handle>,
    disposed_handle: Option<Handle>,
    stream: Option<JoinHandle<()>>,
    client_public_key: Option<[u8; KEY_SIZE]>,
    acks_received: usize,
    reclaimed: usize,
    withheld: usize,
}

/// 루프백 상대방
pub struct LoopbackTransport {
    script: Arc<PeerScript>,
    peer_keys: KeyPair,
    welcome: Vec<u8>,
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackTransport {
    pub fn new(script: PeerScript) -> Self {
        let peer_keys = X25519.generate_key_pair();
        let welcome = match (&script.raw_welcome, &script.welcome_message, script.offer_key) {
            (Some(raw), _, _) => raw.clone(),
            (None, None, false) => Vec::new(),
            (None, message, offer_key) => build_welcome(
                message.as_deref().unwrap_or(""),
                offer_key.then(|| peer_keys.public_key_bytes()).as_ref(),
            ),
        };

        Self {
            script: Arc::new(script),
            peer_keys,
            welcome,
            state: Arc::new(Mutex::new(LoopbackState::default())),
        }
    }

    /// 지금까지의 호출 기록
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    /// 폐기 이후 발행된 연산 수
    pub fn calls_after_dispose(&self) -> usize {
        self.state.lock().calls_after_dispose
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// connect가 반환한 핸들
    pub fn issued_handle(&self) -> Option<Handle> {
        self.state.lock().issued
    }

    /// dispose에 전달된 핸들
    pub fn disposed_handle(&self) -> Option<Handle> {
        self.state.lock().disposed_handle
    }

    /// 스트리밍 스레드 종료까지 대기 (회수 집계 확정)
    pub fn wait_stream(&self) {
        let stream = self.state.lock().stream.take();
        if let Some(stream) = stream {
            let _ = stream.join();
        }
    }

    /// 상대방이 받은 클라이언트 공개키
    pub fn client_public_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.state.lock().client_public_key
    }

    /// 상대방 측에서 계산한 공유 비밀
    pub fn peer_shared_secret(&self) -> Option<[u8; KEY_SIZE]> {
        let client_key = self.client_public_key()?;
        Some(X25519.shared_secret(&client_key, self.peer_keys.private_key_bytes()))
    }

    /// 설치된 공유 키
    pub fn installed_key(&self) -> Option<Vec<u8>> {
        self.state.lock().calls.iter().find_map(|call| match call {
            TransportCall::InstallKey { key, .. } => Some(key.clone()),
            _ => None,
        })
    }

    pub fn acks_received(&self) -> usize {
        self.state.lock().acks_received
    }

    /// 회수 허용된 청크 버퍼 수
    pub fn reclaimed(&self) -> usize {
        self.state.lock().reclaimed
    }

    /// 회수 신호 없이 반환된 청크 버퍼 수
    pub fn withheld(&self) -> usize {
        self.state.lock().withheld
    }

    pub fn welcome(&self) -> &[u8] {
        &self.welcome
    }

    fn record(&self, call: TransportCall) {
        let mut state = self.state.lock();
        if state.disposed {
            state.calls_after_dispose += 1;
        }
        state.calls.push(call);
    }

    fn has(&self, fault: Fault) -> bool {
        self.script.has(fault)
    }
}

/// 완료 통지는 호출자 스택 밖에서
fn deliver(f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::spawn(f)
}

impl Transport for LoopbackTransport {
    fn connect(&self, peer: &str, params: SessionParameters) -> Option<Handle> {
        self.record(TransportCall::Connect {
            peer: peer.to_owned(),
        });
        if self.has(Fault::RefuseConnect) {
            return None;
        }

        let handle = Handle::new(u64::from(rand::random::<u32>()) | 1)?;
        {
            let mut state = self.state.lock();
            state.on_error = Some(params.on_error);
            state.issued = Some(handle);
        }

        let notified = if self.has(Fault::ConnectNotifiesInvalid) {
            None
        } else if self.has(Fault::ConnectNotifiesOtherHandle) {
            Handle::new(handle.get() + 2)
        } else {
            Some(handle)
        };
        let welcome = self.welcome.clone();
        let on_connected = params.on_connected;
        deliver(move || on_connected(notified, &welcome, welcome.len() as i32));

        Some(handle)
    }

    fn install_key(&self, _handle: Handle, key: &[u8], budget: u32, eom: EndOfMessage) -> i32 {
        self.record(TransportCall::InstallKey {
            key: key.to_vec(),
            budget,
            eom,
        });
        if self.has(Fault::RejectKeyInstall) {
            return -1;
        }
        0
    }

    fn write(&self, handle: Handle, data: Bytes, eom: EndOfMessage, on_done: NotifyOnce) -> i32 {
        self.record(TransportCall::Write {
            data: data.clone(),
            eom,
        });

        let is_ack = data.as_ref() == ACK_PAYLOAD;
        if is_ack && self.has(Fault::RejectAckWrite) {
            return -1;
        }

        let failed = {
            let mut state = self.state.lock();
            if is_ack {
                state.acks_received += 1;
                self.has(Fault::FailAckCompletion)
            } else {
                if self.script.offer_key && data.len() == KEY_SIZE {
                    state.client_public_key = <[u8; KEY_SIZE]>::try_from(data.as_ref()).ok();
                }
                self.has(Fault::FailPublicKeySend)
            }
        };

        let result = if failed { -1 } else { data.len() as i32 };
        deliver(move || on_done(handle, ServiceCode::NotifyBufferReady, result));
        0
    }

    fn read(&self, handle: Handle, mut buf: BytesMut, on_done: ReadDone) -> i32 {
        self.record(TransportCall::Read {
            capacity: buf.len(),
        });
        if self.has(Fault::RefuseRead) {
            return -1;
        }
        if self.has(Fault::StallName) {
            // 완료 통지 없이 콜백 폐기
            return 0;
        }
        if self.has(Fault::ResetOnName) {
            if let Some(on_error) = self.state.lock().on_error.clone() {
                deliver(move || on_error(handle, ServiceCode::NotifyReset, -1));
            }
            return 0;
        }

        let (code, count) = if self.has(Fault::NameNotDataReady) {
            (ServiceCode::NotifyReset, 0)
        } else if self.has(Fault::ZeroLengthName) {
            (ServiceCode::NotifyDataReady, 0)
        } else {
            let mut raw = self.script.file_name.as_bytes().to_vec();
            raw.push(0);
            let n = raw.len().min(buf.len());
            buf[..n].copy_from_slice(&raw[..n]);
            (ServiceCode::NotifyDataReady, n as i32)
        };

        deliver(move || on_done(handle, code, count, buf));
        0
    }

    fn recv_inline(&self, handle: Handle, mut on_chunk: ChunkFn) -> i32 {
        self.record(TransportCall::RecvInline);
        if self.has(Fault::RefuseRecvInline) {
            return -1;
        }

        let script = self.script.clone();
        let state = self.state.clone();

        let stream = deliver(move || {
            let empty: &[u8] = &[];
            let chunks: Vec<&[u8]> = if script.content.is_empty() {
                vec![empty]
            } else {
                script.content.chunks(script.chunk_size).collect()
            };
            let last = chunks.len() - 1;

            for (index, chunk) in chunks.into_iter().enumerate() {
                if state.lock().disposed {
                    debug!("루프백: 폐기된 세션, 스트림 중단");
                    return;
                }

                if script.has(Fault::NegativeChunkAt(index)) {
                    let reclaim = on_chunk(handle, empty, -1, false);
                    tally(&state, reclaim);
                    return;
                }
                if script.has(Fault::EmptyChunkAt(index)) {
                    let reclaim = on_chunk(handle, empty, 0, true);
                    tally(&state, reclaim);
                }

                let reclaim = on_chunk(handle, chunk, chunk.len() as i32, index < last);
                tally(&state, reclaim);
            }
        });
        self.state.lock().stream = Some(stream);
        0
    }

    fn shutdown(&self, handle: Handle, on_done: NotifyOnce) -> i32 {
        self.record(TransportCall::Shutdown);
        if self.has(Fault::RefuseShutdown) {
            return -1;
        }

        let result = if self.has(Fault::FailShutdownCompletion) { -1 } else { 0 };
        let flush_notice = if self.has(Fault::FlushNoticeOnShutdown) {
            self.state.lock().on_error.clone()
        } else {
            None
        };

        // 같은 스레드에서 순서대로: 통지 후 완료
        deliver(move || {
            if let Some(on_error) = flush_notice {
                on_error(handle, ServiceCode::NotifyFlushed, 0);
            }
            on_done(handle, ServiceCode::NotifyFinish, result);
        });
        0
    }

    fn dispose(&self, handle: Handle) -> i32 {
        self.record(TransportCall::Dispose);
        let mut state = self.state.lock();
        state.disposed = true;
        state.disposed_handle = Some(handle);
        0
    }

    fn set_error_callback(&self, _handle: Handle, on_error: ErrorFn) -> i32 {
        self.record(TransportCall::SetErrorCallback);
        self.state.lock().on_error = Some(on_error);
        0
    }
}

fn tally(state: &Mutex<LoopbackState>, reclaim: bool) {
    let mut state = state.lock();
    if reclaim {
        state.reclaimed += 1;
    } else {
        state.withheld += 1;
    }
}
