use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, bail};
use arc_swap::ArcSwap;
use clap::{Parser, Subcommand};
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cachecore::cache::Cache;
use cachecore::cdb::Cdb;
use cachecore::config::{Settings, load_config};
use cachecore::proto_utils::{cache_key, domain_from_dot, min_answer_ttl};
use cachecore::random::DnsRandom;
use cachecore::resolve::resolve;
use cachecore::transmit::{Servers, Transmit};
use cachecore::watcher;

#[derive(Parser, Debug)]
#[command(author, version, about = "DNS cache core diagnostics", long_about = None)]
struct Args {
    /// 配置文件路径（JSON，可选）
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send queries upstream, caching answers; repeated names hit the cache.
    Query {
        /// Record type, e.g. A, AAAA, MX.
        qtype: String,
        #[arg(required = true)]
        names: Vec<String>,
        /// 上游服务器（可重复，最多16个）；缺省取配置。
        #[arg(short = 's', long = "server")]
        servers: Vec<Ipv4Addr>,
        /// Set RD and allow the full retry schedule.
        #[arg(long, default_value_t = false)]
        recursive: bool,
    },
    /// Print every value stored under a key.
    Get { file: PathBuf, key: String },
    /// Answer keys read from stdin, reloading the database when it is replaced.
    Lookup { file: Option<PathBuf> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let settings = match &args.config {
        Some(path) => load_config(path).context("load config")?.settings,
        None => Settings::default(),
    };

    match args.command {
        Command::Query {
            qtype,
            names,
            servers,
            recursive,
        } => run_query(&settings, &qtype, &names, &servers, recursive).await,
        Command::Get { file, key } => {
            let db = Cdb::open(&file).with_context(|| format!("open database {}", file.display()))?;
            let values = db.get_all(key.as_bytes()).context("database lookup")?;
            if values.is_empty() {
                bail!("key not found: {key}");
            }
            for v in values {
                println!("{}", String::from_utf8_lossy(&v));
            }
            Ok(())
        }
        Command::Lookup { file } => {
            let path = file
                .or_else(|| settings.data_path.clone())
                .context("no database file given and settings.data_path unset")?;
            run_lookup(path).await
        }
    }
}

async fn run_query(
    settings: &Settings,
    qtype: &str,
    names: &[String],
    servers: &[Ipv4Addr],
    recursive: bool,
) -> anyhow::Result<()> {
    let rtype = RecordType::from_str(&qtype.to_ascii_uppercase())
        .with_context(|| format!("unknown record type: {qtype}"))?;
    let qtype_wire = u16::from(rtype).to_be_bytes();
    let servers = if servers.is_empty() {
        settings.server_list()
    } else {
        Servers::from_slice(servers)
    };

    let mut rng = DnsRandom::new(names.join(" ").as_bytes());
    let mut cache = Cache::new(settings.cache_size, &mut rng).context("allocate cache")?;
    let mut tx = Transmit::new(settings.transmit_policy());

    for name in names {
        let qname = domain_from_dot(name).with_context(|| format!("invalid name: {name}"))?;
        let key = cache_key(qtype_wire, &qname).context("cache key")?;

        if let Some(hit) = cache.get(&key) {
            println!(";; {name} {rtype} from cache, ttl {}", hit.ttl);
            print_packet(hit.data)?;
            continue;
        }

        tx.start(servers, recursive, &qname, qtype_wire, &mut rng)
            .with_context(|| format!("start query for {name}"))?;
        let packet = tokio::select! {
            res = resolve(&mut tx, &mut rng) => res.with_context(|| format!("query {name} {rtype}"))?,
            _ = tokio::signal::ctrl_c() => bail!("interrupted"),
        };
        tx.free();

        match min_answer_ttl(&packet) {
            Some(ttl) if ttl > 0 => {
                cache.set(&key, &packet, ttl);
                debug!(name = %name, ttl, "answer cached");
            }
            _ => debug!(name = %name, "answer not cached"),
        }
        println!(";; {name} {rtype} from upstream");
        print_packet(&packet)?;
    }

    let stats = cache.stats();
    info!(size = stats.size, hsize = stats.hsize, used = stats.used, motion = stats.motion, "cache stats");
    Ok(())
}

fn print_packet(packet: &[u8]) -> anyhow::Result<()> {
    let msg = Message::from_vec(packet).context("decode reply")?;
    println!(";; rcode {} answers {}", msg.response_code(), msg.answers().len());
    for record in msg.answers() {
        println!("{record}");
    }
    Ok(())
}

async fn run_lookup(path: PathBuf) -> anyhow::Result<()> {
    let db = Cdb::open(&path).with_context(|| format!("open database {}", path.display()))?;
    let db = Arc::new(ArcSwap::from_pointee(db));
    watcher::spawn(path.clone(), db.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let key = line.trim_end();
        match db.load().get_all(key.as_bytes()) {
            Ok(values) if values.is_empty() => println!("{key}: not found"),
            Ok(values) => {
                for v in values {
                    println!("{key}: {}", String::from_utf8_lossy(&v));
                }
            }
            Err(err) => warn!(key = %key, error = %err, "lookup failed"),
        }
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    // 非 debug 仅 warn，可由 RUST_LOG 覆盖
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
