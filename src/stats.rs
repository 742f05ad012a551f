//! 수신 통계

use std::path::PathBuf;
use std::time::{Duration, Instant};

/// 파일 하나의 수신 결과
#[derive(Debug, Clone)]
pub struct ReceiveStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 종료 시점까지 걸린 시간 (완료 전이면 None)
    pub finished_in: Option<Duration>,

    /// 상대방 환영 메시지
    pub welcome_message: Option<String>,

    /// 공유 키 설치 여부
    pub encrypted: bool,

    /// 수신 파일 이름
    pub file_name: Option<String>,

    /// 저장 경로
    pub path: Option<PathBuf>,

    /// 총 수신 바이트
    pub total_bytes: u64,

    /// 데이터가 있는 청크 수
    pub total_chunks: u64,

    /// 길이 0 청크 수
    pub empty_deliveries: u64,

    /// 가장 큰 청크 크기
    pub largest_chunk: usize,

    crc: u32,
}

impl ReceiveStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            finished_in: None,
            welcome_message: None,
            encrypted: false,
            file_name: None,
            path: None,
            total_bytes: 0,
            total_chunks: 0,
            empty_deliveries: 0,
            largest_chunk: 0,
            crc: 0,
        }
    }

    /// 청크 기록
    pub fn record_chunk(&mut self, data: &[u8]) {
        let mut hasher = crc32fast::Hasher::new_with_initial(self.crc);
        hasher.update(data);
        self.crc = hasher.finalize();

        self.total_bytes += data.len() as u64;
        self.total_chunks += 1;
        self.largest_chunk = self.largest_chunk.max(data.len());
    }

    /// 빈 청크 기록
    pub fn record_empty(&mut self) {
        self.empty_deliveries += 1;
    }

    pub fn finish(&mut self) {
        self.finished_in = Some(self.start_time.elapsed());
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.finished_in.unwrap_or_else(|| self.start_time.elapsed())
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 수신 내용 CRC32
    pub fn crc32(&self) -> u32 {
        self.crc
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "File: {} | Bytes: {} | Chunks: {} (empty {}) | CRC32: {:08X} | Elapsed: {:.2}s | Throughput: {:.2} MB/s | Encrypted: {}",
            self.file_name.as_deref().unwrap_or("-"),
            self.total_bytes,
            self.total_chunks,
            self.empty_deliveries,
            self.crc,
            self.elapsed().as_secs_f64(),
            self.throughput() / 1_000_000.0,
            self.encrypted,
        )
    }
}

impl Default for ReceiveStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_crc_matches_whole() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut stats = ReceiveStats::new();
        for chunk in data.chunks(4096) {
            stats.record_chunk(chunk);
        }
        stats.record_empty();

        assert_eq!(stats.crc32(), crc32fast::hash(&data));
        assert_eq!(stats.total_bytes, 10_000);
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.empty_deliveries, 1);
        assert_eq!(stats.largest_chunk, 4096);
    }

    #[test]
    fn test_finish_freezes_elapsed() {
        let mut stats = ReceiveStats::new();
        stats.finish();
        let first = stats.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.elapsed(), first);
        assert!(stats.summary().contains("Bytes: 0"));
    }
}
