use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use image_builder::{
    load_config, BuildError, CacheStatus, CacheStore, CancelToken, Context, DiskCache,
    Fingerprint, OciLayoutClient, Pipeline,
};
use tracing_subscriber::EnvFilter;

/// Blobs, lock files and staging dirs younger than this survive `gc` and `sweep`.
const GRACE_PERIOD: Duration = Duration::from_secs(60 * 60);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn usage() -> &'static str {
    "Usage:\n  image-builder build <config.toml> [--push] [--no-cache]\n  image-builder digest <dir> [exclude...]\n  image-builder cache status <cache_dir>\n  image-builder cache gc <cache_dir>\n  image-builder cache sweep <cache_dir>\n  image-builder cache invalidate <cache_dir> <fingerprint>"
}

fn main() -> ExitCode {
    init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(hint) = err.downcast_ref::<BuildError>().and_then(BuildError::hint) {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("IMAGE_BUILDER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &[String]) -> Result<()> {
    match args {
        [build, config, flags @ ..] if build == "build" => build_image(Path::new(config), flags),
        [digest, dir, exclude @ ..] if digest == "digest" => print_digest(Path::new(dir), exclude),
        [cache, status, dir] if cache == "cache" && status == "status" => {
            cache_status(Path::new(dir))
        }
        [cache, gc, dir] if cache == "cache" && gc == "gc" => cache_gc(Path::new(dir)),
        [cache, sweep, dir] if cache == "cache" && sweep == "sweep" => {
            cache_sweep(Path::new(dir))
        }
        [cache, invalidate, dir, fingerprint] if cache == "cache" && invalidate == "invalidate" => {
            cache_invalidate(Path::new(dir), fingerprint)
        }
        _ => bail!(usage()),
    }
}

extern "C" fn on_interrupt(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route Ctrl-C into the build's cancellation token.
fn install_interrupt_handler() -> CancelToken {
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
    CancelToken::from_static(&INTERRUPTED)
}

fn build_image(config_path: &Path, flags: &[String]) -> Result<()> {
    let mut push = false;
    let mut no_cache = false;
    for flag in flags {
        match flag.as_str() {
            "--push" => push = true,
            "--no-cache" => no_cache = true,
            other => bail!("unknown build flag '{other}'\n{}", usage()),
        }
    }

    let loaded = load_config(config_path)?;
    let mut config = loaded.build;
    config.push |= push;

    let cache = match (&config.cache_dir, no_cache) {
        (Some(dir), false) => Some(
            DiskCache::open(dir)
                .with_context(|| format!("opening cache '{}'", dir.display()))?,
        ),
        _ => None,
    };
    let registry = match &loaded.oci_layout {
        Some(dir) => Some(
            OciLayoutClient::open(dir)
                .with_context(|| format!("opening OCI layout '{}'", dir.display()))?,
        ),
        None => None,
    };

    let mut pipeline = Pipeline::new().with_cancel(install_interrupt_handler());
    if let Some(cache) = &cache {
        pipeline = pipeline.with_cache(cache);
    }
    if let Some(registry) = &registry {
        pipeline = pipeline.with_registry(registry);
    }

    let outcome = pipeline
        .run(&config)
        .with_context(|| format!("building '{}'", config_path.display()))?;

    let cache_line = match &outcome.cache {
        CacheStatus::Hit => "hit".to_string(),
        CacheStatus::Stored => "stored".to_string(),
        CacheStatus::AlreadyStored => "already stored".to_string(),
        CacheStatus::NotCached(reason) => format!("not cached ({reason})"),
        CacheStatus::Disabled => "disabled".to_string(),
    };
    println!("fingerprint: {}", outcome.fingerprint);
    println!("manifest:    {}", outcome.manifest_digest);
    for (index, digest) in outcome.layer_digests.iter().enumerate() {
        println!("layer {index}:     {digest}");
    }
    println!("cache:       {cache_line}");
    if let Some(pushed) = &outcome.pushed {
        let target = config.image_ref.as_deref().unwrap_or_default();
        println!("pushed:      {target}@{pushed}");
    }
    Ok(())
}

fn print_digest(dir: &Path, exclude: &[String]) -> Result<()> {
    let context = Context::build(dir, exclude)
        .with_context(|| format!("reading context '{}'", dir.display()))?;
    println!(
        "{}  {} entries, {} bytes",
        context.digest(),
        context.len(),
        context.content_size()
    );
    Ok(())
}

fn open_cache(dir: &Path) -> Result<DiskCache> {
    DiskCache::open(dir).with_context(|| format!("opening cache '{}'", dir.display()))
}

fn cache_status(dir: &Path) -> Result<()> {
    let status = open_cache(dir)?
        .status()
        .context("reading cache status")?;
    println!("cache:        {}", status.root.display());
    println!("entries:      {}", status.index_entries);
    println!("corrupt:      {}", status.corrupt_entries);
    println!("blobs:        {} ({} bytes)", status.blobs, status.blob_bytes);
    println!("unreferenced: {}", status.unreferenced_blobs);
    println!("staging:      {}", status.staging_dirs);
    Ok(())
}

fn cache_gc(dir: &Path) -> Result<()> {
    let report = open_cache(dir)?
        .gc(GRACE_PERIOD)
        .context("collecting unreferenced blobs")?;
    println!(
        "removed {} blobs ({} bytes), kept {} recent, pruned {} lock files",
        report.removed_blobs, report.freed_bytes, report.kept_recent, report.removed_locks
    );
    Ok(())
}

fn cache_sweep(dir: &Path) -> Result<()> {
    let removed = open_cache(dir)?
        .sweep_staging(GRACE_PERIOD)
        .context("sweeping abandoned staging directories")?;
    println!("removed {removed} staging directories");
    Ok(())
}

fn cache_invalidate(dir: &Path, fingerprint: &str) -> Result<()> {
    let fingerprint = Fingerprint::parse(fingerprint)
        .with_context(|| format!("invalid fingerprint '{fingerprint}'"))?;
    let cache = open_cache(dir)?;
    if cache
        .invalidate(&fingerprint)
        .with_context(|| format!("invalidating {fingerprint}"))?
    {
        println!("invalidated {fingerprint}");
    } else {
        println!("no entry for {fingerprint}");
    }
    Ok(())
}
