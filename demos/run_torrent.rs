//! A thin binary that wires a descriptor file up to the engine and runs it
//! until Ctrl-C.
//!
//! This is illustrative only: command-line parsing and logging setup are
//! explicitly out of scope for the library itself (see the crate's design
//! notes), so none of this is part of the tested library surface.

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use cratetorrent::conf::Conf;

/// Downloads (or seeds) a single-file torrent described by a descriptor
/// file.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the .torrent descriptor file.
    descriptor: PathBuf,

    /// Directory the downloaded (or seeded) file lives in.
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,

    /// Port the inbound listener accepts peer connections on.
    #[arg(long, default_value_t = 6881)]
    listen_port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let descriptor = match std::fs::read(&args.descriptor) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!(
                "failed to read descriptor {}: {}",
                args.descriptor.display(),
                e
            );
            return ExitCode::FAILURE;
        }
    };

    let mut conf = Conf::new(args.download_dir);
    conf.torrent.listen_port = args.listen_port;

    let engine = match cratetorrent::engine::Engine::new(conf, &descriptor).await
    {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to start engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    log::info!("info hash: {}", hex::encode(engine.info_hash()));
    match engine.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("engine exited with an error: {}", e);
            ExitCode::FAILURE
        }
    }
}
