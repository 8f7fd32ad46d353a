// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runs a post-copy region end to end: a page server supplying pages from a
//! memory snapshot file (or synthetic content) and a set of consumer threads
//! faulting the whole region in and verifying every page.

mod logger;
mod server;
mod source;
mod workload;

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use log::{LevelFilter, error, info};
use postcopy::{ConfigError, Region, RegionConfig, RegionError};
use vmm_sys_util::eventfd::EventFd;

use crate::logger::{Logger, LoggerError};
use crate::server::{PageServer, ServeMode, ServeStats, ServerError};
use crate::source::{PageSource, SourceError};
use crate::workload::{ConsumerReport, WorkloadError};

/// Size of the synthetic memory when no memory file is given (64 MiB).
const DEFAULT_SYNTHETIC_SIZE: usize = 64 << 20;

#[derive(Debug, Parser)]
#[command(
    name = "page-server",
    version,
    about = "Serves a post-copy memory region to a set of consumer threads."
)]
struct Cli {
    /// Memory snapshot file holding the page contents.
    #[arg(long)]
    mem_file: Option<PathBuf>,
    /// Size in bytes of the synthetic memory served when no memory file is given.
    #[arg(long, default_value_t = DEFAULT_SYNTHETIC_SIZE)]
    size: usize,
    /// JSON file with the region configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Page size in bytes, overriding the configuration.
    #[arg(long)]
    page_size: Option<usize>,
    /// How pages are provided.
    #[arg(long, value_enum, default_value_t = ServeMode::OnDemand)]
    mode: ServeMode,
    /// Answer each request with the aligned chunk of this many bytes containing it.
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Release backing store pages once they are bound.
    #[arg(long)]
    reclaim: bool,
    /// Number of consumer threads.
    #[arg(long, default_value_t = 4)]
    consumers: usize,
    /// Log level.
    #[arg(long, default_value_t = LevelFilter::Info)]
    level: LevelFilter,
}

/// Errors of the page-server binary.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
enum MainError {
    /// Cannot initialize logging: {0}
    Logger(#[from] LoggerError),
    /// Cannot read the region configuration file: {0}
    ReadConfig(std::io::Error),
    /// Invalid region configuration: {0}
    Config(#[from] ConfigError),
    /// Cannot load page contents: {0}
    Source(#[from] SourceError),
    /// Region error: {0}
    Region(#[from] RegionError),
    /// Page server failed: {0}
    Server(#[from] ServerError),
    /// Consumer failed: {0}
    Workload(#[from] WorkloadError),
    /// Cannot use the stop event: {0}
    EventFd(std::io::Error),
    /// A worker thread panicked
    ThreadPanic,
    /// Cannot serialize metrics: {0}
    Metrics(serde_json::Error),
}

fn region_config(cli: &Cli) -> Result<RegionConfig, MainError> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(MainError::ReadConfig)?;
            RegionConfig::from_json(&raw)?
        }
        None => RegionConfig::default(),
    };
    if let Some(page_size) = cli.page_size {
        config.page_size = page_size;
    }
    config.validate()?;
    Ok(config)
}

fn main_exec(cli: Cli) -> Result<(), MainError> {
    Logger::init(cli.level)?;

    let config = region_config(&cli)?;
    let source = match &cli.mem_file {
        Some(path) => PageSource::from_file(path)?,
        None => PageSource::pattern(cli.size),
    };
    let init = Region::initialize(config, source.size())?;
    let region = init.region;
    info!(
        "Serving {:#x} bytes in {:?} mode to {} consumers",
        init.actual_size, cli.mode, cli.consumers
    );

    let mut server = PageServer::new(
        region.clone(),
        &source,
        cli.mode,
        cli.chunk_size,
        cli.reclaim,
    )?;
    let mappings = (0..cli.consumers)
        .map(|_| region.map_consumer())
        .collect::<Result<Vec<_>, _>>()?;
    let stop = EventFd::new(libc::EFD_NONBLOCK).map_err(MainError::EventFd)?;

    let (served, consumed) = thread::scope(|s| {
        let serving = s.spawn(|| server.run(&stop));
        let consumers = mappings
            .iter()
            .enumerate()
            .map(|(id, mapping)| {
                let source = &source;
                s.spawn(move || workload::run_consumer(id, mapping, source))
            })
            .collect::<Vec<_>>();

        let consumed: Vec<Result<ConsumerReport, MainError>> = consumers
            .into_iter()
            .map(|consumer| {
                consumer
                    .join()
                    .map_err(|_| MainError::ThreadPanic)?
                    .map_err(MainError::from)
            })
            .collect();
        if consumed.iter().any(Result::is_err) {
            // Fail the remaining waiters instead of leaving them blocked.
            region.teardown();
        }

        let served: Result<ServeStats, MainError> = stop
            .write(1)
            .map_err(MainError::EventFd)
            .and_then(|()| {
                serving
                    .join()
                    .map_err(|_| MainError::ThreadPanic)?
                    .map_err(MainError::from)
            });
        (served, consumed)
    });

    let mut total = ConsumerReport::default();
    for report in consumed {
        let report = report?;
        total.pages += report.pages;
        total.blocked += report.blocked;
    }
    let served = served?;
    info!(
        "Consumers verified {} pages ({} blocked); server answered {} requests with {} pages ({} pushed)",
        total.pages, total.blocked, served.requests, served.pages, served.pushed
    );

    // Supply whatever nobody touched, then drop the protocol.
    server.populate_all()?;
    region.finalize()?;

    let metrics = serde_json::to_string_pretty(region.metrics()).map_err(MainError::Metrics)?;
    println!("{}", metrics);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match main_exec(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            eprintln!("page-server: {}", err);
            ExitCode::FAILURE
        }
    }
}
