//! 수신 파일 싱크
//!
//! - 한 번만 열고 한 번만 닫는다
//! - 닫힌 뒤에는 쓰지 않는다

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::Result;

/// 쓰기 전용 목적지 파일
#[derive(Debug)]
pub struct Sink {
    path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
}

impl Sink {
    /// 순차 쓰기용으로 파일 열기
    ///
    /// `overwrite`가 false면 이미 존재하는 파일은 에러
    pub async fn open(path: PathBuf, overwrite: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let file = options.open(&path).await?;
        debug!("싱크 열림: {}", path.display());

        Ok(Self {
            path,
            file: Some(file),
            bytes_written: 0,
        })
    }

    /// 데이터 추가
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        file.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// flush 후 닫기 (`sync`면 디스크 동기화까지)
    pub async fn close(&mut self, sync: bool) -> Result<()> {
        let mut file = self.file.take().ok_or_else(closed_error)?;
        file.flush().await?;
        if sync {
            file.sync_all().await?;
        }
        debug!(
            "싱크 닫힘: {} ({} bytes)",
            self.path.display(),
            self.bytes_written
        );
        Ok(())
    }

    /// 부분 수신 파일 삭제
    pub async fn discard(mut self) {
        // 열린 핸들부터 정리
        self.file.take();
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!("부분 파일 삭제 실패 {}: {}", self.path.display(), e);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

fn closed_error() -> crate::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "싱크가 이미 닫힘").into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_append_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = Sink::open(path.clone(), false).await.unwrap();
        sink.append(b"hello ").await.unwrap();
        sink.append(b"world").await.unwrap();
        assert_eq!(sink.bytes_written(), 11);
        sink.close(true).await.unwrap();
        assert!(sink.is_closed());

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_no_write_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Sink::open(dir.path().join("x"), false).await.unwrap();
        sink.close(false).await.unwrap();

        assert!(sink.append(b"late").await.is_err());
        assert!(sink.close(false).await.is_err());
        assert_eq!(sink.bytes_written(), 0);
    }

    #[tokio::test]
    async fn test_create_new_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exists.txt");
        std::fs::write(&path, b"old").unwrap();

        assert!(Sink::open(path.clone(), false).await.is_err());

        let mut sink = Sink::open(path.clone(), true).await.unwrap();
        sink.append(b"new").await.unwrap();
        sink.close(false).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_discard_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let mut sink = Sink::open(path.clone(), false).await.unwrap();
        sink.append(&[1, 2, 3]).await.unwrap();

        sink.discard().await;
        assert!(!path.exists());
    }
}
