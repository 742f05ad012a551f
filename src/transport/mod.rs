//! 세션 전송 계층 인터페이스
//!
//! 연결 수립, 패킷 프레이밍, 재전송, 혼잡 제어는 전송 계층의 몫이다.
//! 클라이언트는 아래 세션 연산만 사용하며, 모든 연산은 "지금 상태 코드 반환 +
//! 나중에 콜백으로 완료 통지" 형태다. 콜백은 임의의 스레드에서 호출될 수 있다.

pub mod loopback;

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

pub use loopback::{Fault, LoopbackTransport, PeerScript, TransportCall};

/// 불투명 세션 핸들
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// 0은 유효하지 않은 핸들
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0.get())
    }
}

/// 전송 계층 서비스/통지 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceCode {
    /// 요청 거부
    Reject = 3,

    /// 연결 종료 요청
    Shutdown = 8,

    /// 연결 수락됨
    NotifyAccepted = 16,

    /// 데이터 준비됨 (읽기 완료)
    NotifyDataReady = 17,

    /// 송신 버퍼 준비됨 (쓰기 완료)
    NotifyBufferReady = 18,

    /// 상대방이 연결 리셋
    NotifyReset = 19,

    /// 송신 데이터 모두 전달됨
    NotifyFlushed = 20,

    /// 정상 종료 완료
    NotifyFinish = 21,

    /// 세션 자원 해제
    Dispose = 22,

    /// 버퍼 오버플로우
    NotifyOverflow = 24,

    /// 전송 계층 타임아웃
    NotifyTimeout = 25,

    /// 이름 해석 실패
    NotifyNameResolutionFailed = 26,
}

/// 메시지 끝 플래그
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfMessage {
    /// 이후 데이터가 이어짐
    NotEnd = 0,

    /// 논리 메시지 완료
    EndOfMessage = 1,
}

/// 연결 통지: (핸들, 환영 메시지, 선언 길이)
pub type ConnectedFn = Box<dyn FnOnce(Option<Handle>, &[u8], i32) + Send>;

/// 에러 통지 (세션 중 재지정 가능)
pub type ErrorFn = Arc<dyn Fn(Handle, ServiceCode, i32) + Send + Sync>;

/// 단발성 완료 통지
pub type NotifyOnce = Box<dyn FnOnce(Handle, ServiceCode, i32) + Send>;

/// 제한 읽기 완료: 빌려준 버퍼를 돌려받는다
pub type ReadDone = Box<dyn FnOnce(Handle, ServiceCode, i32, BytesMut) + Send>;

/// 스트리밍 읽기 콜백: (청크, 길이, 후속 데이터 여부) -> 버퍼 회수 허용
///
/// 청크 슬라이스는 호출 동안에만 유효하다.
pub type ChunkFn = Box<dyn FnMut(Handle, &[u8], i32, bool) -> bool + Send>;

/// 연결 시 전달하는 파라미터 묶음 (전송 계층이 한 번 소비)
pub struct SessionParameters {
    pub on_connected: ConnectedFn,
    pub on_error: ErrorFn,

    /// 상대방에게 보낼 환영 메시지 (선택)
    pub welcome: Option<Bytes>,

    /// 전송 계층 전용 플래그
    pub flags: u32,

    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl fmt::Debug for SessionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParameters")
            .field("welcome", &self.welcome)
            .field("flags", &self.flags)
            .field("recv_buffer_size", &self.recv_buffer_size)
            .field("send_buffer_size", &self.send_buffer_size)
            .finish_non_exhaustive()
    }
}

/// 세션 전송 계층
///
/// 음수 반환값은 요청이 큐에 들어가지 못했다는 뜻이다.
pub trait Transport: Send + Sync + 'static {
    /// 연결 시작. 핸들은 즉시 반환되지만 연결 성공 여부는 `on_connected`로 통지된다.
    fn connect(&self, peer: &str, params: SessionParameters) -> Option<Handle>;

    /// 공유 키 설치
    fn install_key(&self, handle: Handle, key: &[u8], budget: u32, eom: EndOfMessage) -> i32;

    /// 쓰기. 완료 시 실제 전송 바이트 수 통지
    fn write(&self, handle: Handle, data: Bytes, eom: EndOfMessage, on_done: NotifyOnce) -> i32;

    /// 버퍼 용량만큼 제한 읽기
    fn read(&self, handle: Handle, buf: BytesMut, on_done: ReadDone) -> i32;

    /// 스트리밍 읽기. 메시지 끝이나 에러까지 콜백 반복 호출
    fn recv_inline(&self, handle: Handle, on_chunk: ChunkFn) -> i32;

    /// 정상 종료 요청
    fn shutdown(&self, handle: Handle, on_done: NotifyOnce) -> i32;

    /// 세션 자원 해제
    fn dispose(&self, handle: Handle) -> i32;

    /// 에러 통지 대상 재지정
    fn set_error_callback(&self, handle: Handle, on_error: ErrorFn) -> i32;
}
