//! Binary entry point for the Tessera maintenance CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tessera::{
    archive::{Archive, ArchiveOptions, ArchiveRecord, ArchiveStats},
    cluster::LookupTable,
    node::{default_config_path, NodeConfig},
    ChangeId, NodeId,
};
use tracing_subscriber::{fmt, EnvFilter};

const DUMP_BATCH_BYTES: usize = 1 << 20;

#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Inspect Tessera change archives and cluster layouts",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Summarize an archive directory")]
    ArchiveInfo {
        #[arg(long, value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Print archived records in id order")]
    ArchiveDump {
        #[arg(long, value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, value_name = "ID", help = "First id to print (defaults to the oldest)")]
        from: Option<u64>,
    },

    #[command(about = "Show the lookup table or the nodes owning one key")]
    Lookup {
        #[arg(long, value_name = "N")]
        nodes: u32,

        #[arg(long, value_name = "R")]
        redundancy: usize,

        #[arg(long, value_name = "KEY")]
        key: Option<String>,
    },

    #[command(about = "Evaluate quorum for a cluster size and live count")]
    Quorum {
        #[arg(long, value_name = "N")]
        nodes: u32,

        #[arg(long, value_name = "K")]
        live: usize,
    },

    #[command(about = "Load and validate a node configuration file")]
    CheckConfig {
        #[arg(value_name = "FILE", env = "TESSERA_CONFIG")]
        path: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct SegmentReport {
    first_id: u64,
    last_id: u64,
    bytes: u64,
    file: String,
}

#[derive(Serialize)]
struct ArchiveInfoReport {
    dir: String,
    stats: ArchiveStats,
    segments: Vec<SegmentReport>,
}

#[derive(Serialize)]
struct RecordReport {
    id: u64,
    kind: &'static str,
    origin: Option<u32>,
    payload_len: usize,
    payload_hex: Option<String>,
}

#[derive(Serialize)]
struct LookupReport {
    nodes: u32,
    redundancy: usize,
    quorum: usize,
    key: Option<String>,
    slots: Vec<Vec<u32>>,
}

#[derive(Serialize)]
struct QuorumReport {
    nodes: u32,
    live: usize,
    required: usize,
    has_quorum: bool,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tessera=info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::ArchiveInfo { dir } => {
            let report = archive_info(&dir)?;
            emit(&cli.format, &report, || print_archive_info_text(&report))?;
        }
        Command::ArchiveDump { dir, from } => {
            let records = archive_dump(&dir, from)?;
            emit(&cli.format, &records, || print_records_text(&records))?;
        }
        Command::Lookup {
            nodes,
            redundancy,
            key,
        } => {
            let report = lookup(nodes, redundancy, key)?;
            emit(&cli.format, &report, || print_lookup_text(&report))?;
        }
        Command::Quorum { nodes, live } => {
            let report = quorum(nodes, live)?;
            emit(&cli.format, &report, || {
                println!(
                    "nodes={} live={} required={} quorum={}",
                    report.nodes,
                    report.live,
                    report.required,
                    if report.has_quorum { "yes" } else { "no" }
                )
            })?;
            if !report.has_quorum {
                std::process::exit(2);
            }
        }
        Command::CheckConfig { path } => {
            let path = path
                .or_else(default_config_path)
                .ok_or("no config file given and no default config directory")?;
            let config = NodeConfig::load(&path)?;
            emit(&cli.format, &config, || {
                println!(
                    "{}: ok (node {} with {} peers, archive {})",
                    path.display(),
                    config.node_id,
                    config.peers.len(),
                    config.archive_dir.display()
                )
            })?;
        }
    }

    Ok(())
}

fn open_existing(dir: &Path) -> Result<Archive, Box<dyn Error>> {
    if !dir.is_dir() {
        return Err(format!("archive directory {} does not exist", dir.display()).into());
    }
    Ok(Archive::open(dir, ArchiveOptions::default())?)
}

fn archive_info(dir: &Path) -> Result<ArchiveInfoReport, Box<dyn Error>> {
    let archive = open_existing(dir)?;
    let segments = archive
        .segments()
        .into_iter()
        .map(|meta| SegmentReport {
            first_id: meta.first_id.0,
            last_id: meta.last_id.0,
            bytes: meta.bytes,
            file: meta
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        })
        .collect();
    Ok(ArchiveInfoReport {
        dir: dir.display().to_string(),
        stats: archive.stats(),
        segments,
    })
}

fn archive_dump(dir: &Path, from: Option<u64>) -> Result<Vec<RecordReport>, Box<dyn Error>> {
    let archive = open_existing(dir)?;
    let last = archive.last_id();
    let mut next = from.map(ChangeId).unwrap_or_else(|| archive.first_id());
    let mut out = Vec::new();
    while next <= last {
        let batch = archive.read_from(next, DUMP_BATCH_BYTES)?;
        let Some(tail) = batch.last() else {
            break;
        };
        next = tail.id().next();
        out.extend(batch.iter().map(record_report));
    }
    Ok(out)
}

fn record_report(record: &ArchiveRecord) -> RecordReport {
    match record {
        ArchiveRecord::Applied(change) => RecordReport {
            id: change.id.0,
            kind: "applied",
            origin: Some(change.origin.0),
            payload_len: change.payload.len(),
            payload_hex: Some(hex::encode(&change.payload)),
        },
        ArchiveRecord::Skipped(id) => RecordReport {
            id: id.0,
            kind: "skipped",
            origin: None,
            payload_len: 0,
            payload_hex: None,
        },
        ArchiveRecord::Cancelled(id) => RecordReport {
            id: id.0,
            kind: "cancelled",
            origin: None,
            payload_len: 0,
            payload_hex: None,
        },
    }
}

fn node_list(nodes: u32) -> Vec<NodeId> {
    (1..=nodes).map(NodeId).collect()
}

fn lookup(nodes: u32, redundancy: usize, key: Option<String>) -> Result<LookupReport, Box<dyn Error>> {
    let table = LookupTable::build(&node_list(nodes), redundancy)?;
    let to_ids = |slot: &[usize]| -> Vec<u32> {
        slot.iter().map(|&idx| table.nodes()[idx].0).collect()
    };
    let slots = match &key {
        Some(key) => vec![to_ids(table.assign(key.as_bytes()))],
        None => table.slots().map(to_ids).collect(),
    };
    Ok(LookupReport {
        nodes,
        redundancy,
        quorum: table.quorum(),
        key,
        slots,
    })
}

fn quorum(nodes: u32, live: usize) -> Result<QuorumReport, Box<dyn Error>> {
    if nodes == 0 {
        return Err("cluster needs at least one node".into());
    }
    if live > nodes as usize {
        return Err(format!("live count {live} exceeds node count {nodes}").into());
    }
    let table = LookupTable::build(&node_list(nodes), 1)?;
    Ok(QuorumReport {
        nodes,
        live,
        required: table.quorum(),
        has_quorum: table.has_quorum(live),
    })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_archive_info_text(report: &ArchiveInfoReport) {
    println!("Archive {}:", report.dir);
    println!(
        "  first_id={} last_id={} segments={} segment_bytes={} tail_len={}",
        report.stats.first_id,
        report.stats.last_id,
        report.stats.segments,
        report.stats.segment_bytes,
        report.stats.tail_len
    );
    for segment in &report.segments {
        println!(
            "  {} [{}..={}] {} bytes",
            segment.file, segment.first_id, segment.last_id, segment.bytes
        );
    }
}

fn print_records_text(records: &[RecordReport]) {
    for record in records {
        match (&record.origin, &record.payload_hex) {
            (Some(origin), Some(payload)) => println!(
                "{:>10} {:<9} origin={} len={} {}",
                record.id, record.kind, origin, record.payload_len, payload
            ),
            _ => println!("{:>10} {}", record.id, record.kind),
        }
    }
}

fn print_lookup_text(report: &LookupReport) {
    println!(
        "nodes={} redundancy={} quorum={}",
        report.nodes, report.redundancy, report.quorum
    );
    match &report.key {
        Some(key) => {
            let owners = report.slots.first().cloned().unwrap_or_default();
            println!("key {key:?} -> {owners:?}");
        }
        None => {
            for (slot, owners) in report.slots.iter().enumerate() {
                println!("  slot {slot}: {owners:?}");
            }
        }
    }
}
