use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::browser::RemoteRenderer;
use crate::cli::config::EngineConfig;
use crate::cli::CrawlArgs;
use crate::crawler::controller::JobCoordinator;
use crate::crawler::progress::ProgressEvent;
use crate::crawler::request::{parse_exclude_patterns, CrawlRequest};
use crate::crawler::task::{CrawlJob, JobStatus};
use crate::storage;

/// Wire the coordinator from configuration
async fn connect(config: &EngineConfig) -> Result<JobCoordinator> {
    let backend = storage::connect_backend(&config.storage).await?;
    let renderer = RemoteRenderer::new(&config.renderer.url, config.renderer_timeout())?;
    Ok(JobCoordinator::new(config, backend, Arc::new(renderer)))
}

/// Turn command line options into a request, falling back to configured defaults
pub fn build_request(config: &EngineConfig, args: &CrawlArgs) -> CrawlRequest {
    let mut request = config.crawler.request_for(&args.url);
    if let Some(depth) = args.depth {
        request.max_depth = depth;
    }
    if let Some(max_urls) = args.max_urls {
        request.max_urls_per_level = max_urls;
    }
    if args.all_domains {
        request.same_domain_only = false;
    }
    if let Some(exclude) = &args.exclude {
        request.exclude_patterns = parse_exclude_patterns(exclude);
    }
    if let Some(delay) = args.delay {
        request.delay_ms = delay;
    }
    request.force_fresh = args.fresh;
    request.job_id = args.job_id.clone();
    request
}

fn format_event(event: &ProgressEvent) -> String {
    format!(
        "[{:>3}%] level {}/{} page {}/{} ({} done, ~{} total) {}",
        event.percent,
        event.current_level,
        event.total_levels.saturating_sub(1),
        event.current_page,
        event.pages_in_level,
        event.pages_processed,
        event.total_estimated,
        event.last_url.as_deref().unwrap_or("")
    )
}

fn write_json<T: Serialize>(value: &T, output: Option<PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .context(format!("Failed to write output file: {}", path.display()))?;
            info!("Result written to: {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn summarize(job: &CrawlJob) {
    eprintln!("Job {}: {} ({} pages)", job.id, job.status, job.total_pages);
    for level in &job.levels {
        let failed = level.pages.iter().filter(|page| !page.is_success()).count();
        eprintln!("  level {}: {} pages, {} failed", level.level, level.pages.len(), failed);
    }
    if let Some(error) = &job.error {
        eprintln!("  error: {}", error);
    }
}

/// Start a crawl; runs it here unless detached
pub async fn crawl(config: &EngineConfig, args: CrawlArgs) -> Result<()> {
    let coordinator = connect(config).await?;
    let request = build_request(config, &args);

    if args.detach {
        let handle = coordinator.enqueue(request).await?;
        if handle.from_cache {
            println!("{} (served from cache)", handle.job_id);
        } else {
            println!("{}", handle.job_id);
            info!("Use `deep-scrape status {}` to check the job status", handle.job_id);
        }
        return Ok(());
    }

    let handle = coordinator.submit(request).await?;
    info!("Crawling job started with ID: {}", handle.job_id);

    let mut events = coordinator.subscribe(&handle.job_id).await?;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => eprintln!("{}", format_event(&event)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling job {}", handle.job_id);
                coordinator.cancel(&handle.job_id).await?;
            }
        }
    }

    // progress has ended, the record turns terminal right after
    let job = coordinator.wait(&handle.job_id, None).await?;
    summarize(&job);
    write_json(&job, args.output)?;

    if job.status != JobStatus::Completed {
        anyhow::bail!("job {} ended {}", job.id, job.status);
    }
    Ok(())
}

/// Execute queued jobs until Ctrl-C
pub async fn worker(config: &EngineConfig, concurrency: usize) -> Result<()> {
    let coordinator = connect(config).await?;
    let (stop, shutdown) = watch::channel(false);

    let workers: Vec<_> = (0..concurrency.max(1))
        .map(|worker| {
            let coordinator = coordinator.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { coordinator.run_worker(worker, shutdown).await })
        })
        .collect();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down workers after their current jobs");
    let _ = stop.send(true);

    for worker in workers {
        worker.await.context("Worker task panicked")?;
    }
    Ok(())
}

/// Check the status of a job
pub async fn status(config: &EngineConfig, job_id: &str) -> Result<()> {
    let coordinator = connect(config).await?;
    let snapshot = coordinator.status(job_id).await?;

    println!("Job ID: {}", snapshot.record.id);
    println!("URL: {}", snapshot.record.base_url);
    println!("Status: {}", snapshot.record.status);
    println!("Created: {}", snapshot.record.created_at);
    if let Some(started) = snapshot.record.started_at {
        println!("Started: {}", started);
    }
    if let Some(finished) = snapshot.record.finished_at {
        println!("Finished: {}", finished);
        println!("Pages: {}", snapshot.record.total_pages);
    }
    if let Some(progress) = &snapshot.progress {
        println!("Progress: {}", format_event(progress));
    }
    if let Some(error) = &snapshot.record.error {
        println!("Error: {}", error);
    }

    Ok(())
}

/// Print or save the result of a finished job
pub async fn result(config: &EngineConfig, job_id: &str, output: Option<PathBuf>) -> Result<()> {
    let coordinator = connect(config).await?;
    let job = coordinator.result(job_id).await?;
    summarize(&job);
    write_json(&job, output)
}

/// Follow a job's progress until it ends
pub async fn watch(config: &EngineConfig, job_id: &str) -> Result<()> {
    let coordinator = connect(config).await?;
    // fail fast on unknown ids instead of waiting forever
    coordinator.status(job_id).await?;

    let mut events = coordinator.subscribe(job_id).await?;
    while let Some(event) = events.next().await {
        println!("{}", format_event(&event));
        if let Some(error) = &event.error {
            println!("error: {}", error);
        }
    }
    Ok(())
}

pub async fn cancel(config: &EngineConfig, job_id: &str) -> Result<()> {
    let coordinator = connect(config).await?;
    let status = coordinator.cancel(job_id).await?;
    if status.is_terminal() {
        println!("Job {} already {}", job_id, status);
    } else {
        println!("Cancellation requested for job {}", job_id);
    }
    Ok(())
}

/// Show where the configuration lives, and optionally its content
pub fn show_config(config: &EngineConfig, path: Option<PathBuf>, show: bool) -> Result<()> {
    let path = path.unwrap_or_else(EngineConfig::default_path);
    println!("Configuration: {}", path.display());
    if show {
        let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
        println!("{}", yaml);
    }
    Ok(())
}
