//! Command-line interface for hblib.
//!
//! Producer side: extract sessions, update the library, build packages.
//! Client side: sync the installed library, inspect it, read images.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::adapters::{ExtractorAdapter, HttpFetcher, SchemeFetcher, SessionExtractor};
use crate::config::{self, ResolvedConfig};
use crate::domain::{LibrarySnapshot, Manifest, PackageRef, PackageType};
use crate::ingest::{update_library, UpdateOptions};
use crate::library::{
    build_archive, build_manifest_package, package_sha256, package_sha256_reader, publish_manifest,
    ArchiveOptions, DirImageProvider, MergePolicy,
};
use crate::sync::{CancelToken, SyncEngine, SyncPaths, SyncReport, SyncSettings, SyncState};

/// hblib - Handball training library packaging and sync
#[derive(Parser, Debug)]
#[command(name = "hblib")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract one session record from a PDF with the configured extractor
    ExtractOne {
        /// Training plan PDF
        pdf: PathBuf,

        /// Write the record here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Merge new sessions from the source directory into the library
    Update {
        /// Source directory (PDFs and JSON records)
        #[arg(short, long)]
        sources: Option<PathBuf>,

        /// Existing library snapshot
        #[arg(short, long)]
        library: Option<PathBuf>,

        /// Where to write the new snapshot (defaults to --library)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Version of the new snapshot (defaults to the current one bumped)
        #[arg(long)]
        version: Option<String>,

        /// Replace sessions that are already in the library
        #[arg(long)]
        upsert: bool,
    },

    /// Build a self-contained archive package (.hblib)
    PackArchive {
        /// Library snapshot to package
        #[arg(short, long)]
        library: Option<PathBuf>,

        /// Directory holding drill_images/
        #[arg(short, long)]
        images: Option<PathBuf>,

        /// Output archive
        #[arg(short, long)]
        output: PathBuf,

        /// Also write the top-level manifest here
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Download URL to advertise in the manifest
        #[arg(long)]
        url: Option<String>,

        /// Changelog note for this version
        #[arg(long)]
        note: Option<String>,
    },

    /// Build a manifest-form package with remote image URLs
    PackRemote {
        /// Library snapshot to package
        #[arg(short, long)]
        library: Option<PathBuf>,

        /// Base URL images are published under
        #[arg(short, long)]
        base_url: Option<String>,

        /// Output JSON
        #[arg(short, long)]
        output: PathBuf,

        /// Also write the top-level manifest here
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Download URL to advertise in the manifest
        #[arg(long)]
        url: Option<String>,

        /// Changelog note for this version
        #[arg(long)]
        note: Option<String>,
    },

    /// Sync the installed library with the published manifest
    Sync {
        /// Manifest URL (http(s), file:// or a path)
        #[arg(long, env = "HBLIB_MANIFEST_URL")]
        manifest_url: Option<String>,
    },

    /// Show the installed library and recent sync attempts
    Status {
        /// Also fetch the manifest and report whether an update is available
        #[arg(short, long)]
        check: bool,

        /// Number of sync attempts to show
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// Read an image of the installed library
    Image {
        /// Logical path (drill_images/TE_078/TE_078_page_2.png)
        path: String,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::ExtractOne { pdf, output } => extract_one(cfg, &pdf, output).await,
            Commands::Update {
                sources,
                library,
                output,
                version,
                upsert,
            } => {
                let policy = if upsert {
                    MergePolicy::Upsert
                } else {
                    MergePolicy::SkipExisting
                };
                update(
                    cfg,
                    sources,
                    library,
                    output,
                    UpdateOptions { version, policy },
                )
                .await
            }
            Commands::PackArchive {
                library,
                images,
                output,
                manifest,
                url,
                note,
            } => pack_archive(cfg, library, images, &output, manifest, url, note).await,
            Commands::PackRemote {
                library,
                base_url,
                output,
                manifest,
                url,
                note,
            } => pack_remote(cfg, library, base_url, &output, manifest, url, note).await,
            Commands::Sync { manifest_url } => sync(cfg, manifest_url).await,
            Commands::Status { check, limit } => show_status(cfg, check, limit).await,
            Commands::Image { path, output } => read_image(cfg, &path, &output).await,
            Commands::Config => show_config(cfg),
        }
    }
}

fn extractor(cfg: &ResolvedConfig) -> ExtractorAdapter {
    ExtractorAdapter::new(
        cfg.extractor.command.clone(),
        cfg.extractor.args.clone(),
        Duration::from_secs(cfg.extractor.timeout_seconds),
    )
}

/// Load the library, or start an empty one if the file does not exist yet
async fn load_or_empty(path: &Path) -> Result<LibrarySnapshot> {
    if path.exists() {
        LibrarySnapshot::load(path).await
    } else {
        warn!(path = %path.display(), "No library yet, starting from an empty one");
        Ok(LibrarySnapshot::new("v0"))
    }
}

async fn extract_one(cfg: &ResolvedConfig, pdf: &Path, output: Option<PathBuf>) -> Result<()> {
    let session = extractor(cfg).extract(pdf).await?;
    if let Err(e) = session.validate() {
        eprintln!("Warning: extracted record is not valid: {}", e);
    }

    let json = serde_json::to_string_pretty(&session)?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("Failed to write record: {}", path.display()))?;
            eprintln!(
                "Session {} ({} drills) written to {}",
                session.id,
                session.drills.len(),
                path.display()
            );
        }
        None => println!("{}", json),
    }

    Ok(())
}

async fn update(
    cfg: &ResolvedConfig,
    sources: Option<PathBuf>,
    library: Option<PathBuf>,
    output: Option<PathBuf>,
    options: UpdateOptions,
) -> Result<()> {
    let sources = sources.unwrap_or_else(|| cfg.sources_dir.clone());
    let library = library.unwrap_or_else(|| cfg.library_file.clone());
    let output = output.unwrap_or_else(|| library.clone());

    let existing = load_or_empty(&library).await?;
    let extractor = extractor(cfg);
    let summary = update_library(
        &existing,
        &sources,
        &options,
        Some(&extractor as &dyn SessionExtractor),
    )
    .await?;

    let report = &summary.report;
    report.snapshot.save(&output).await?;

    println!("Library {} -> {}", existing.version(), report.snapshot.version());
    println!("  Sources scanned:   {}", summary.sources);
    println!("  Already present:   {}", summary.skipped_sources.len());
    println!("  Sessions added:    {}", report.added.len());
    println!("  Sessions skipped:  {}", report.skipped.len());
    if !report.replaced.is_empty() {
        println!("  Sessions replaced: {}", report.replaced.len());
    }
    let stats = report.snapshot.stats();
    println!(
        "  Total:             {} sessions, {} drills, {} images",
        stats.sessions, stats.drills, stats.images
    );
    println!("  Written to:        {}", output.display());

    for rejected in &report.rejected {
        eprintln!("Rejected record #{}: {}", rejected.index, rejected.error);
    }
    for failure in &summary.failures {
        eprintln!("Failed source {}: {}", failure.path.display(), failure.error);
    }

    Ok(())
}

/// Write the top-level manifest next to a package, carrying over the
/// previous manifest's id, app requirement and changelog
async fn write_manifest(
    cfg: &ResolvedConfig,
    manifest_path: &Path,
    snapshot: &LibrarySnapshot,
    package: PackageRef,
    note: Option<String>,
) -> Result<Manifest> {
    let previous = if manifest_path.exists() {
        let bytes = tokio::fs::read(manifest_path).await?;
        Some(
            Manifest::from_json(&bytes)
                .with_context(|| format!("Failed to parse manifest: {}", manifest_path.display()))?,
        )
    } else {
        None
    };

    let fresh = previous.is_none();
    let note = note.or_else(|| cfg.publish.changelog_note.clone());
    let mut manifest = publish_manifest(previous, snapshot, package, note.as_deref());
    if fresh {
        manifest.library_id = cfg.publish.library_id.clone();
        manifest.min_app_version = cfg.publish.min_app_version.clone();
    }

    if let Some(parent) = manifest_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(manifest_path, serde_json::to_string_pretty(&manifest)?)
        .await
        .with_context(|| format!("Failed to write manifest: {}", manifest_path.display()))?;

    Ok(manifest)
}

fn default_url(output: &Path) -> String {
    output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| output.display().to_string())
}

async fn pack_archive(
    cfg: &ResolvedConfig,
    library: Option<PathBuf>,
    images: Option<PathBuf>,
    output: &Path,
    manifest: Option<PathBuf>,
    url: Option<String>,
    note: Option<String>,
) -> Result<()> {
    let library = library.unwrap_or_else(|| cfg.library_file.clone());
    let images = images.unwrap_or_else(|| cfg.images_dir.clone());
    let snapshot = LibrarySnapshot::load(&library).await?;

    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let output_path = output.to_path_buf();
    let build_snapshot = snapshot.clone();
    let (report, sha256, size) = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::create(&output_path)
            .with_context(|| format!("Failed to create archive: {}", output_path.display()))?;
        let provider = DirImageProvider::new(images);
        let (file, report) =
            build_archive(&build_snapshot, &provider, file, ArchiveOptions::default())?;
        file.sync_all()?;
        drop(file);

        let written = std::fs::File::open(&output_path)
            .with_context(|| format!("Failed to reopen archive: {}", output_path.display()))?;
        let (sha256, size) = package_sha256_reader(std::io::BufReader::new(written))?;
        Ok::<_, anyhow::Error>((report, sha256, size))
    })
    .await??;

    println!("Archive written: {}", output.display());
    println!("  Version:       {}", report.snapshot.version());
    println!("  Images:        {} files, {} references", report.images_written, report.image_references);
    println!("  Size:          {:.1} MB", size as f64 / 1024.0 / 1024.0);
    println!("  SHA-256:       {}", sha256);
    for missing in &report.unresolved {
        eprintln!(
            "Missing image {} (removed from {}): {}",
            missing.logical_path,
            missing.drill_ids.join(", "),
            missing.reason
        );
    }

    if let Some(manifest_path) = manifest {
        let package = PackageRef {
            url: url.unwrap_or_else(|| default_url(output)),
            kind: PackageType::Zip,
            sha256: Some(sha256),
        };
        // The archive may have dropped unresolved images; advertise what it holds
        let manifest = write_manifest(cfg, &manifest_path, &report.snapshot, package, note).await?;
        println!("Manifest written: {} ({})", manifest_path.display(), manifest.version);
    }

    Ok(())
}

async fn pack_remote(
    cfg: &ResolvedConfig,
    library: Option<PathBuf>,
    base_url: Option<String>,
    output: &Path,
    manifest: Option<PathBuf>,
    url: Option<String>,
    note: Option<String>,
) -> Result<()> {
    let library = library.unwrap_or_else(|| cfg.library_file.clone());
    let base_url = base_url
        .or_else(|| cfg.publish.image_base_url.clone())
        .context("No image base URL. Use --base-url or set library.image_base_url")?;
    let snapshot = LibrarySnapshot::load(&library).await?;

    let bytes = build_manifest_package(&snapshot, &base_url)?;
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(output, &bytes)
        .await
        .with_context(|| format!("Failed to write package: {}", output.display()))?;

    let sha256 = package_sha256(&bytes);
    println!("Package written: {}", output.display());
    println!("  Version:  {}", snapshot.version());
    println!("  Size:     {:.1} KB", bytes.len() as f64 / 1024.0);
    println!("  Images:   {} (remote, base {})", snapshot.stats().images, base_url);

    if let Some(manifest_path) = manifest {
        let package = PackageRef {
            url: url.unwrap_or_else(|| default_url(output)),
            kind: PackageType::Json,
            sha256: Some(sha256),
        };
        let manifest = write_manifest(cfg, &manifest_path, &snapshot, package, note).await?;
        println!("Manifest written: {} ({})", manifest_path.display(), manifest.version);
    }

    Ok(())
}

async fn open_engine(cfg: &ResolvedConfig, manifest_url: Option<String>) -> Result<SyncEngine> {
    let http = HttpFetcher::new(Duration::from_secs(cfg.client.http_timeout_seconds))?;
    let settings = SyncSettings {
        manifest_url: manifest_url
            .or_else(|| cfg.client.manifest_url.clone())
            .unwrap_or_default(),
        app_version: cfg.client.app_version.clone(),
        cache_max_bytes: cfg.client.cache_max_bytes,
        paths: SyncPaths::under(&cfg.home),
    };

    Ok(SyncEngine::open(settings, Arc::new(SchemeFetcher::new(http))).await?)
}

async fn sync(cfg: &ResolvedConfig, manifest_url: Option<String>) -> Result<()> {
    let manifest_url = manifest_url
        .or_else(|| cfg.client.manifest_url.clone())
        .context("No manifest URL. Use --manifest-url or set client.manifest_url")?;
    let engine = open_engine(cfg, Some(manifest_url)).await?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancelling...");
                cancel.cancel();
            }
        });
    }

    let mut states = engine.subscribe();
    let progress = tokio::spawn(async move {
        let mut last_phase = None;
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            if Some(state.phase()) != last_phase {
                eprintln!("[{}]", state);
                last_phase = Some(state.phase());
            }
            if let SyncState::Failed { .. } | SyncState::Installed { .. } | SyncState::UpToDate { .. } = state {
                break;
            }
        }
    });

    let outcome = engine.sync(&cancel).await;
    progress.abort();

    match outcome {
        Ok(SyncReport::UpToDate { installed, remote }) => {
            println!("Up to date: {} (remote {})", installed, remote);
        }
        Ok(SyncReport::Installed {
            version,
            previous,
            package_type,
        }) => {
            println!(
                "Installed {} ({} package, previously {})",
                version,
                package_type,
                previous.as_deref().unwrap_or("none")
            );
        }
        Err(e) => {
            eprintln!("Sync failed: {}", e);
            if e.is_retryable() {
                eprintln!("(the installed library is unchanged; retry later)");
            }
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn show_status(cfg: &ResolvedConfig, check: bool, limit: usize) -> Result<()> {
    let engine = open_engine(cfg, None).await?;

    match engine.installed() {
        Some(installed) => {
            let state = &installed.state;
            println!("Installed: {} ({} package)", state.version, state.package_type);
            println!("  Installed at: {}", state.installed_at);
            println!(
                "  Content:      {} sessions, {} drills, {} images",
                state.stats.sessions, state.stats.drills, state.stats.images
            );
        }
        None => println!("Installed: (none)"),
    }
    println!(
        "Asset cache: {} files, {} / {} bytes",
        engine.cache().len(),
        engine.cache().total_bytes(),
        engine.cache().max_bytes()
    );

    let attempts = engine.journal().attempts().await?;
    if !attempts.is_empty() {
        println!();
        println!("{:<38} {:<26} {:<12} {:<10}", "ATTEMPT", "STARTED", "RESULT", "VERSION");
        println!("{}", "-".repeat(88));
        for attempt in attempts.iter().rev().take(limit) {
            println!(
                "{:<38} {:<26} {:<12} {:<10}",
                attempt.attempt_id,
                attempt.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                attempt.phase,
                attempt.version.as_deref().unwrap_or("-")
            );
            if let Some(error) = &attempt.error {
                println!("  {}", error);
            }
        }
    }

    if check {
        if engine.settings().manifest_url.is_empty() {
            anyhow::bail!("No manifest URL configured (client.manifest_url or HBLIB_MANIFEST_URL)");
        }
        let check = engine.check().await?;
        println!();
        println!("Remote: {} ({} package)", check.manifest.version, check.manifest.package.kind);
        if !check.compatible {
            println!(
                "  Requires app {} (this app is {})",
                check.manifest.min_app_version, cfg.client.app_version
            );
        } else if check.update_available {
            println!("  Update available");
        } else {
            println!("  Up to date");
        }
    }

    Ok(())
}

async fn read_image(cfg: &ResolvedConfig, logical_path: &str, output: &Path) -> Result<()> {
    let engine = open_engine(cfg, None).await?;
    let image = engine
        .image_ref(logical_path)
        .with_context(|| format!("No image {} in the installed library", logical_path))?;

    let bytes = engine.image(&image).await?;
    tokio::fs::write(output, bytes.as_slice())
        .await
        .with_context(|| format!("Failed to write image: {}", output.display()))?;

    println!("{} ({} bytes) -> {}", logical_path, bytes.len(), output.display());
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    let paths = SyncPaths::under(&cfg.home);

    println!("hblib configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Producer:");
    println!("  Library:        {}", cfg.library_file.display());
    println!("  Sources:        {}", cfg.sources_dir.display());
    println!("  Images:         {}", cfg.images_dir.display());
    println!("  Library id:     {}", cfg.publish.library_id);
    println!("  Min app:        {}", cfg.publish.min_app_version);
    println!(
        "  Image base URL: {}",
        cfg.publish.image_base_url.as_deref().unwrap_or("(not set)")
    );
    println!("  Extractor:      {} {}", cfg.extractor.command, cfg.extractor.args.join(" "));
    println!();
    println!("Client:");
    println!("  Home:           {}", cfg.home.display());
    println!("  Installed:      {}", paths.installed_dir.display());
    println!("  Cache:          {}", paths.cache_dir.display());
    println!("  Journal:        {}", paths.journal_path.display());
    println!(
        "  Manifest URL:   {}",
        cfg.client.manifest_url.as_deref().unwrap_or("(not set)")
    );
    println!("  App version:    {}", cfg.client.app_version);
    println!("  Cache budget:   {} bytes", cfg.client.cache_max_bytes);
    println!("  HTTP timeout:   {}s", cfg.client.http_timeout_seconds);

    Ok(())
}
