use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Context;
use colored::Colorize;
use tracing::debug;

use ecm_blob::{Blob, MAIN_BLOB_XPATH};
use ecm_dispatch::{BlobManagerConfig, BlobReferences, DocumentBlobManager, DocumentContext};
use ecm_types::{BlobKey, DocumentId};

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = BlobManagerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let manager = config.build().context("configuring blob providers")?;
    debug!(?manager, "blob manager ready");
    let repository = cli.repository.as_str();
    match cli.command {
        Command::Check(_) => cmd_check(&manager),
        Command::Route(args) => cmd_route(&manager, repository, args),
        Command::Put(args) => cmd_put(&manager, repository, args),
        Command::Cat(args) => cmd_cat(&manager, repository, args),
        Command::Gc(args) => cmd_gc(&manager, repository, args),
    }
}

fn cmd_check(manager: &DocumentBlobManager) -> anyhow::Result<()> {
    let registry = manager.registry();
    println!(
        "{} {} providers, dispatcher {}",
        "✓".green().bold(),
        registry.len(),
        manager.dispatcher().name().cyan()
    );
    for id in registry.ids() {
        let Some(provider) = registry.get(id) else {
            continue;
        };
        let mut traits = Vec::new();
        if provider.is_record_mode() {
            traits.push("record".to_string());
        }
        if provider.is_transient() {
            traits.push("transient".to_string());
        }
        if let Some(record) = provider.record_provider() {
            traits.push(format!("records → {record}"));
        }
        let managed = if manager.managed_provider_ids().contains(id) { "managed" } else { "unmanaged" };
        println!(
            "  {} [{}] storage {} {}",
            id.as_str().yellow(),
            managed,
            provider.storage_id().bold(),
            traits.join(", ").dimmed()
        );
    }
    if manager.has_shared_storage() {
        println!("{} shared storage detected, blob deletion is disabled", "!".yellow().bold());
    }
    Ok(())
}

fn context<'a>(
    repository: &'a str,
    doc_id: &'a DocumentId,
    doc_type: &'a str,
    is_record: bool,
    properties: &'a BTreeMap<String, String>,
) -> DocumentContext<'a> {
    DocumentContext {
        repository,
        doc_id,
        doc_type,
        is_record,
        retained: false,
        properties,
    }
}

fn cmd_route(manager: &DocumentBlobManager, repository: &str, args: RouteArgs) -> anyhow::Result<()> {
    let mut blob = Blob::from_bytes(Vec::new());
    if let Some(mime) = &args.mime {
        blob.set_mime_type(mime.as_str());
    }
    if let Some(name) = &args.name {
        blob = blob.with_filename(name.as_str());
    }
    let doc_id = DocumentId::new();
    let properties = BTreeMap::new();
    let doc = context(repository, &doc_id, &args.doc_type, args.record, &properties);
    let dispatch = manager.route(&blob, &doc, &args.xpath)?;
    println!(
        "{} provider {} (prefix: {})",
        "→".green().bold(),
        dispatch.provider_id.as_str().yellow().bold(),
        if dispatch.add_prefix { "yes" } else { "no" }
    );
    Ok(())
}

fn cmd_put(manager: &DocumentBlobManager, repository: &str, args: PutArgs) -> anyhow::Result<()> {
    let data = std::fs::read(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
    let mut blob = Blob::from_bytes(data);
    if let Some(name) = args.file.file_name().and_then(|n| n.to_str()) {
        blob = blob.with_filename(name);
    }
    if let Some(mime) = &args.mime {
        blob.set_mime_type(mime.as_str());
    }
    let doc_id = match &args.doc {
        Some(raw) => raw.parse::<DocumentId>()?,
        None => DocumentId::new(),
    };
    let properties = BTreeMap::new();
    let doc = context(repository, &doc_id, "File", args.record, &properties);
    let stored = manager
        .write_blob(Some(&blob), &doc, MAIN_BLOB_XPATH)?
        .context("blob manager returned no blob")?;
    let key = stored.key().context("stored blob has no key")?;
    println!("{} {} ({} bytes, document {})", "✓".green().bold(), key.to_string().yellow(), stored.length(), doc_id);
    Ok(())
}

fn cmd_cat(manager: &DocumentBlobManager, repository: &str, args: CatArgs) -> anyhow::Result<()> {
    let key = BlobKey::parse(&args.key)?;
    let data = manager.read_blob(&key, repository)?;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

/// Live keys read from a file, one per line.
struct LiveKeys {
    repository: String,
    keys: Vec<BlobKey>,
}

impl BlobReferences for LiveKeys {
    fn repository_name(&self) -> &str {
        &self.repository
    }

    fn mark_referenced_blobs(&self, marker: &mut dyn FnMut(&BlobKey)) {
        for key in &self.keys {
            marker(key);
        }
    }
}

fn cmd_gc(manager: &DocumentBlobManager, repository: &str, args: GcArgs) -> anyhow::Result<()> {
    let mut keys = Vec::new();
    if let Some(path) = &args.live {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
            keys.push(BlobKey::parse(line).with_context(|| format!("invalid key {line:?}"))?);
        }
    }
    let live = LiveKeys {
        repository: repository.to_string(),
        keys,
    };
    let status = manager.garbage_collect_binaries(&[&live], args.delete)?;
    let verb = if args.delete { "deleted" } else { "collectable" };
    println!(
        "{} GC: {} binaries ({} bytes), {} {} ({} bytes) in {:?}",
        "✓".green(),
        status.num_binaries,
        status.size_binaries,
        status.num_binaries_gc.to_string().bold(),
        verb,
        status.size_binaries_gc,
        status.gc_duration
    );
    Ok(())
}
