#[macro_use]
extern crate tracing;

use clap::Parser;
use eyre::{
    bail,
    Context as _,
    Result,
};
use futures::StreamExt as _;
use serde::Serialize;
use std::{
    collections::BTreeSet,
    path::PathBuf,
    pin::pin,
    sync::Arc,
    time::Duration,
};
use tab_request_monitor::{
    badge::BadgeBoard,
    classify::RecordFilter,
    context::Context,
    dns::{
        DnsCache,
        DnsProvider,
        DohClient,
    },
    events::read_events,
    export,
    record::TabId,
    router,
    settings::{
        validate_codes,
        ConfigStore,
        ACCEPTABLE_CODES_KEY,
        DNS_PROVIDER_KEY,
    },
    storage::Storage,
};
use tokio::io::{
    AsyncBufRead,
    BufReader,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
enum Args {
    /// Feed a JSON-lines log of browser events through the monitor and report per-tab error counts.
    Replay(ArgsReplay),
    /// Check whether a single domain resolves.
    Resolve(ArgsResolve),
    /// Inspect or change the persisted settings.
    #[command(subcommand)]
    Settings(SettingsCommand),
}

#[derive(Parser)]
struct ArgsStorage {
    #[clap(
        long,
        env = "MONITOR_STORAGE",
        help = "JSON file holding the settings. If not set, settings are kept in memory"
    )]
    storage: Option<PathBuf>,
}

#[derive(Parser)]
struct ArgsDns {
    #[clap(
        long,
        env = "DNS_PROVIDER",
        help = "DoH resolver to verify domains with (google, cloudflare or an https:// url). Overrides the stored setting"
    )]
    dns_provider: Option<DnsProvider>,

    #[clap(
        long,
        env = "DNS_CACHE_TTL",
        help = "How long a DNS verification is cached",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    dns_cache_ttl: Duration,

    #[clap(
        long,
        env = "DNS_ERROR_TTL",
        help = "How long a failed DNS verification is cached. Defaults to --dns-cache-ttl",
        value_parser = humantime::parse_duration
    )]
    dns_error_ttl: Option<Duration>,

    #[clap(
        long,
        env = "DNS_TIMEOUT",
        help = "Timeout of a single DoH request. If not set, the HTTP client default applies",
        value_parser = humantime::parse_duration
    )]
    dns_timeout: Option<Duration>,
}

#[derive(Parser)]
struct ArgsReplay {
    #[clap(flatten)]
    storage: ArgsStorage,

    #[clap(flatten)]
    dns: ArgsDns,

    #[clap(help = "Event log to replay, - for stdin", default_value = "-")]
    events: String,

    #[clap(long, help = "Tab to export. Defaults to the last activated tab")]
    tab: Option<TabId>,

    #[clap(long, help = "Which records to export: all, http-errors or dns-errors", default_value = "all")]
    filter: RecordFilter,

    #[clap(long, help = "Write the exported tab as CSV to this file")]
    csv: Option<PathBuf>,

    #[clap(long, help = "Write the exported tab as HAR 1.2 to this file")]
    har: Option<PathBuf>,
}

#[derive(Parser)]
struct ArgsResolve {
    #[clap(flatten)]
    dns: ArgsDns,

    domain: String,
}

#[derive(clap::Subcommand)]
enum SettingsCommand {
    Show(ArgsStorage),
    SetCodes {
        #[clap(flatten)]
        storage: ArgsStorage,
        #[clap(required = true, value_delimiter = ',')]
        codes: Vec<u16>,
    },
    SetProvider {
        #[clap(flatten)]
        storage: ArgsStorage,
        provider: DnsProvider,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Args::parse() {
        Args::Replay(args) => replay(args).await?,
        Args::Resolve(ArgsResolve { dns, domain }) => {
            let cache = dns_cache(&dns, dns.dns_provider.clone().unwrap_or_default())?;
            let verification = cache.verify(&domain).await;
            println!("{}", serde_json::to_string_pretty(&verification)?);
        }
        Args::Settings(cmd) => settings(cmd).await?,
    }

    Ok(())
}

async fn open_storage(args: &ArgsStorage) -> Result<Arc<Storage>> {
    let storage = match &args.storage {
        Some(path) => Storage::open(path)
            .await
            .with_context(|| format!("unable to open settings storage {path:?}"))?,
        None => Storage::in_memory(),
    };
    Ok(Arc::new(storage))
}

fn dns_cache(args: &ArgsDns, provider: DnsProvider) -> Result<DnsCache<DohClient>> {
    let client = DohClient::new(provider, args.dns_timeout)?;
    Ok(DnsCache::with_ttl(
        client,
        args.dns_cache_ttl,
        args.dns_error_ttl.unwrap_or(args.dns_cache_ttl),
    ))
}

async fn replay(
    ArgsReplay {
        storage,
        dns,
        events,
        tab,
        filter,
        csv,
        har,
    }: ArgsReplay,
) -> Result<()> {
    let storage = open_storage(&storage).await?;
    let board = Arc::new(BadgeBoard::new());
    let ctx = Context::load(storage, dns_cache(&dns, DnsProvider::default())?, board.clone()).await?;

    if let Some(provider) = dns.dns_provider {
        // not persisted
        ctx.settings().set_dns_provider(provider.clone());
        ctx.dns().use_provider(provider);
    }

    let _listener = ctx.spawn_settings_listener();

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if events == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(&events)
            .await
            .with_context(|| format!("unable to open event log {events:?}"))?;
        Box::new(BufReader::new(file))
    };

    info!("Replaying events from {events}");

    let mut events = pin!(read_events(reader));
    let mut checks = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if let Some(check) = router::handle_event(&ctx, event).await {
                    checks.push(check);
                }
            }
            Err(err) => warn!("Skipping event: {err}"),
        }
    }

    debug!("Waiting for {} DNS checks", checks.len());
    for result in futures::future::join_all(checks).await {
        if let Err(err) = result {
            error!("DNS check task failed: {err}");
        }
    }

    for tab in ctx.tab_ids().await {
        let snapshot = ctx.get_requests(tab).await;
        println!(
            "tab={tab} requests={} http_errors={} dns_errors={} badge={:?}",
            snapshot.requests.len(),
            snapshot.error_count,
            snapshot.dns_error_count,
            board.text(tab)
        );
    }

    if csv.is_none() && har.is_none() {
        return Ok(());
    }

    let Some(tab) = tab.or_else(|| ctx.active_tab()) else {
        bail!("no tab to export, pass --tab");
    };
    let snapshot = ctx.get_requests_filtered(tab, filter).await;

    if let Some(path) = csv {
        tokio::fs::write(&path, export::to_csv(&snapshot.requests))
            .await
            .with_context(|| format!("unable to write {path:?}"))?;
        info!("Exported {} requests of tab {tab} to {path:?}", snapshot.requests.len());
    }

    if let Some(path) = har {
        let har = serde_json::to_vec_pretty(&export::to_har(&snapshot.requests))?;
        tokio::fs::write(&path, har)
            .await
            .with_context(|| format!("unable to write {path:?}"))?;
        info!("Exported {} requests of tab {tab} to {path:?}", snapshot.requests.len());
    }

    Ok(())
}

/// Same shape as the storage keys.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ShownSettings<'a> {
    acceptable_codes: &'a BTreeSet<u16>,
    dns_provider: &'a str,
}

async fn settings(cmd: SettingsCommand) -> Result<()> {
    match cmd {
        SettingsCommand::Show(storage) => {
            let storage = open_storage(&storage).await?;
            let settings = ConfigStore::load(&storage).await?.current();
            let shown = ShownSettings {
                acceptable_codes: &settings.acceptable_codes,
                dns_provider: settings.dns_provider.id(),
            };
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }

        SettingsCommand::SetCodes { storage, codes } => {
            let storage = persistent_storage(&storage).await?;
            let codes = validate_codes(codes)?;
            storage.set(ACCEPTABLE_CODES_KEY, &codes).await?;
            info!(?codes, "acceptable codes saved");
        }

        SettingsCommand::SetProvider { storage, provider } => {
            let storage = persistent_storage(&storage).await?;
            storage.set(DNS_PROVIDER_KEY, provider.id()).await?;
            info!(%provider, "dns provider saved");
        }
    }

    Ok(())
}

async fn persistent_storage(args: &ArgsStorage) -> Result<Arc<Storage>> {
    if args.storage.is_none() {
        bail!("changing settings requires --storage or MONITOR_STORAGE");
    }
    open_storage(args).await
}
