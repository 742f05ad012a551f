//! FileSync 클라이언트 (수신자)
//!
//! 프로세스 내 루프백 상대방에 연결해 파일 하나를 받는다.
//! - 환영 메시지에 공개키가 있으면 X25519 공유 키 설치 (선택)
//! - 스트리밍 수신 후 "0000" 확인 응답, 정상 종료
//!
//! 사용법:
//!   cargo run --release --bin filesync-client -- [OPTIONS]
//!
//! 예시:
//!   # 로컬 파일을 상대방이 보내도록 하고 ./inbox에 수신
//!   cargo run --release --bin filesync-client -- --serve Cargo.toml --recv-dir inbox
//!
//!   # 임의 데이터 10MB + 키 교환
//!   cargo run --release --bin filesync-client -- --size 10485760 --encrypt

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use filesync::transport::{LoopbackTransport, PeerScript};
use filesync::{ClientConfig, FileClient, DEFAULT_STAGE_TIMEOUT_MS};

/// 실행 옵션
struct CliOptions {
    recv_dir: PathBuf,
    serve_path: Option<PathBuf>,
    size: usize,
    name: Option<String>,
    encrypt: bool,
    chunk_size: usize,
    timeout_ms: u64,
    overwrite: bool,
    verbose: bool,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            recv_dir: PathBuf::from("."),
            serve_path: None,
            size: 1024 * 1024,
            name: None,
            encrypt: false,
            chunk_size: 64 * 1024,
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            overwrite: false,
            verbose: false,
        }
    }
}

fn parse_args() -> Result<CliOptions, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = CliOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--recv-dir" | "-d" => {
                options.recv_dir = PathBuf::from(arg_value(&args, i)?);
                i += 1;
            }
            "--serve" => {
                options.serve_path = Some(PathBuf::from(arg_value(&args, i)?));
                i += 1;
            }
            "--size" => {
                options.size = arg_value(&args, i)?.parse().map_err(|_| "유효한 숫자 필요")?;
                i += 1;
            }
            "--name" | "-n" => {
                options.name = Some(arg_value(&args, i)?.to_owned());
                i += 1;
            }
            "--encrypt" | "-e" => {
                options.encrypt = true;
            }
            "--chunk-size" => {
                options.chunk_size = arg_value(&args, i)?
                    .parse()
                    .map_err(|_| "유효한 숫자 필요")?;
                i += 1;
            }
            "--timeout-ms" => {
                options.timeout_ms = arg_value(&args, i)?
                    .parse()
                    .map_err(|_| "유효한 숫자 필요")?;
                i += 1;
            }
            "--overwrite" => {
                options.overwrite = true;
            }
            "--verbose" | "-v" => {
                options.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"FileSync Client - 단일 파일 수신 클라이언트

루프백 상대방이 밀어주는 파일 하나를 수신
- 환영 메시지 공개키로 X25519 키 교환 (선택)
- 스트리밍 수신 후 확인 응답 + 정상 종료

사용법:
  cargo run --release --bin filesync-client -- [OPTIONS]

옵션:
  -d, --recv-dir <DIR>     수신 디렉토리 (기본: .)
  --serve <FILE>           상대방이 보낼 로컬 파일
  --size <BYTES>           --serve 없을 때 임의 데이터 크기 (기본: 1048576)
  -n, --name <NAME>        상대방이 알릴 파일 이름
  -e, --encrypt            환영 메시지에 공개키 첨부 (키 교환)
  --chunk-size <BYTES>     스트리밍 청크 크기 (기본: 65536)
  --timeout-ms <MS>        단계 타임아웃, 0이면 무제한 (기본: 30000)
  --overwrite              기존 파일 덮어쓰기
  -v, --verbose            디버그 로그
  -h, --help               이 도움말 출력

로그 레벨은 RUST_LOG로도 지정 가능
"#
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("알 수 없는 옵션 무시: {}", other);
            }
        }
        i += 1;
    }

    Ok(options)
}

fn arg_value(args: &[String], i: usize) -> Result<&str, Box<dyn std::error::Error>> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 옵션에 값이 필요함", args[i]).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = parse_args()?;

    // 로깅 설정 (RUST_LOG 우선)
    let default_level = if options.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // 상대방이 보낼 내용
    let (content, default_name) = match &options.serve_path {
        Some(path) => {
            let data = tokio::fs::read(path).await?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or("파일 이름이 없는 경로")?;
            (Bytes::from(data), name)
        }
        None => {
            let data: Vec<u8> = (0..options.size).map(|_| rand::random::<u8>()).collect();
            (Bytes::from(data), "random.bin".to_owned())
        }
    };
    let expected_crc = crc32fast::hash(&content);
    let expected_len = content.len();

    let mut script = PeerScript::new(options.name.clone().unwrap_or(default_name), content)
        .with_chunk_size(options.chunk_size);
    if options.encrypt {
        script = script.with_key();
    }

    tokio::fs::create_dir_all(&options.recv_dir).await?;
    let timeout = (options.timeout_ms > 0).then(|| Duration::from_millis(options.timeout_ms));
    let mut config = ClientConfig::new()
        .with_recv_dir(&options.recv_dir)
        .with_stage_timeout(timeout);
    config.overwrite_existing = options.overwrite;

    info!("FileSync Client starting...");
    info!("Receive directory: {}", options.recv_dir.display());
    info!("Stage timeout: {:?}", config.stage_timeout);

    let transport = Arc::new(LoopbackTransport::new(script));
    let client = FileClient::new(transport, config);

    let stats = match client.receive("loopback").await {
        Ok(stats) => stats,
        Err(e) => {
            error!("수신 실패: {}", e);
            return Err(e.into());
        }
    };

    info!("Transfer complete!");
    info!("  Time: {:.2}s", stats.elapsed().as_secs_f64());
    info!("  Total bytes: {}", stats.total_bytes);
    info!("  Total chunks: {}", stats.total_chunks);
    info!("  Throughput: {:.2} MB/s", stats.throughput() / 1_000_000.0);
    info!("  Encrypted: {}", stats.encrypted);
    if let Some(path) = &stats.path {
        info!("Data saved to {:?}", path);
    }

    if stats.crc32() == expected_crc && stats.total_bytes == expected_len as u64 {
        info!("  CRC32: {:08X} (verified)", stats.crc32());
    } else {
        warn!(
            "  CRC32 mismatch: expected {:08X} / {} bytes, got {:08X} / {} bytes",
            expected_crc,
            expected_len,
            stats.crc32(),
            stats.total_bytes
        );
    }

    Ok(())
}
