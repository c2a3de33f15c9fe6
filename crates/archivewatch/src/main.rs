use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use archivewatch_core::archivist::Archivist;
use archivewatch_core::config::{ResolvedSettings, load_config};
use archivewatch_core::history::compress_history;
use archivewatch_core::lru::PageLru;
use archivewatch_core::mediawiki::MediaWikiFetcher;
use archivewatch_core::page::{Address, Page};
use archivewatch_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, resolve_paths,
};
use archivewatch_core::snapshot::Snapshot;
use archivewatch_core::timestamp::normalize_date_input;
use archivewatch_core::translate::{HttpTranslator, ProgressCallback, TranslationQueue};
use archivewatch_core::watcher::{ArchiveWatcher, UnresolvedNode, WatcherStore};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_OWNER: &str = "local";

#[derive(Debug, Parser)]
#[command(
    name = "archivewatch",
    version,
    about = "Browse and watch archive catalogue pages on a MediaWiki site"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the .archivewatch layout and config")]
    Init(InitArgs),
    #[command(about = "List known archive/subarchive pairs")]
    Archives,
    #[command(about = "Show one catalogue page")]
    Page(PageArgs),
    #[command(about = "Show the revision history of a catalogue page")]
    History(HistoryArgs),
    #[command(about = "Manage archive watchers")]
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite existing config/catalog files")]
    force: bool,
    #[arg(long, help = "Skip writing .archivewatch/config.toml")]
    no_config: bool,
    #[arg(long, help = "Write an editable copy of the archive catalog")]
    catalog: bool,
}

#[derive(Debug, Args)]
struct AddressArgs {
    archive: String,
    subarchive: String,
    fond: Option<String>,
    opus: Option<String>,
    case: Option<String>,
}

impl AddressArgs {
    fn address(&self) -> Address {
        Address::new(
            &self.archive,
            &self.subarchive,
            self.fond.as_deref(),
            self.opus.as_deref(),
            self.case.as_deref(),
        )
    }
}

#[derive(Debug, Args)]
struct PageArgs {
    #[command(flatten)]
    address: AddressArgs,
    #[arg(long, value_name = "DATE", value_parser = parse_date, help = "Show the version current at DATE")]
    as_of: Option<String>,
    #[arg(long, value_name = "DATE", value_parser = parse_date, help = "Annotate changes since the version at DATE")]
    compare: Option<String>,
    #[arg(long, help = "Translate untranslated text before printing")]
    translate: bool,
    #[arg(long, help = "Print the snapshot as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[command(flatten)]
    address: AddressArgs,
    #[arg(long, value_name = "DATE", value_parser = parse_date)]
    since: Option<String>,
    #[arg(long, value_name = "N", help = "Keep one revision per day, at most N")]
    max: Option<usize>,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[command(subcommand)]
    command: WatchSubcommand,
}

#[derive(Debug, Args)]
struct OwnerArgs {
    #[arg(long, default_value = DEFAULT_OWNER)]
    owner: String,
}

#[derive(Debug, Subcommand)]
enum WatchSubcommand {
    #[command(about = "Create a watcher and run its first check")]
    Add {
        archive: String,
        subarchive: String,
        #[arg(long, value_name = "DATE", value_parser = parse_date)]
        cutoff: String,
        #[command(flatten)]
        owner: OwnerArgs,
    },
    Check {
        archive: String,
        subarchive: String,
        #[arg(long, help = "Print unresolved changes as a tree")]
        tree: bool,
        #[command(flatten)]
        owner: OwnerArgs,
    },
    Resolve {
        #[command(flatten)]
        address: AddressArgs,
        #[arg(long, help = "Also resolve everything below the address")]
        deep: bool,
        #[command(flatten)]
        owner: OwnerArgs,
    },
    Unresolve {
        #[command(flatten)]
        address: AddressArgs,
        #[command(flatten)]
        owner: OwnerArgs,
    },
    List {
        #[command(flatten)]
        owner: OwnerArgs,
    },
    Remove {
        archive: String,
        subarchive: String,
        #[command(flatten)]
        owner: OwnerArgs,
    },
}

/// Everything a command needs once paths and config are resolved.
struct Session {
    paths: ResolvedPaths,
    settings: ResolvedSettings,
    archivist: Archivist,
    pages: PageLru,
}

impl Session {
    fn open(runtime: &RuntimeOptions) -> Result<Self> {
        let paths = resolve_runtime_paths(runtime)?;
        let config = load_config(&paths.config_path)?;
        let settings = config.resolve()?;
        let store = paths.open_store(&settings)?;
        let catalog = Arc::new(paths.load_catalog()?);
        let fetcher = Arc::new(MediaWikiFetcher::new(settings.mediawiki_settings())?);
        let archivist = Archivist::new(store, fetcher, catalog, settings.archivist_settings());
        let pages = PageLru::new(settings.page_capacity, settings.page_window);
        Ok(Self {
            paths,
            settings,
            archivist,
            pages,
        })
    }

    fn watchers(&self, owner: &str) -> WatcherStore {
        WatcherStore::new(self.archivist.store_handle(), owner)
    }

    fn load_page(&self, address: &Address) -> Result<Page> {
        Ok(self.pages.lookup(&self.archivist, address)?)
    }

    /// Canonical `(tag, subarchive)` for user input such as `dako Д`.
    fn archive_pair(&self, archive: &str, subarchive: &str) -> Result<(String, String)> {
        if self.archivist.catalog().archive_tag(archive).is_none() {
            bail!("unknown archive tag: {archive}");
        }
        let address = self
            .archivist
            .canonical_address(&Address::archive(archive, subarchive));
        Ok((address.archive, address.subarchive))
    }

    fn load_watcher(&self, owner: &str, archive: &str, subarchive: &str) -> Result<ArchiveWatcher> {
        let (archive, subarchive) = self.archive_pair(archive, subarchive)?;
        self.watchers(owner)
            .load(&archive, &subarchive)?
            .with_context(|| format!("no watcher for {archive}-{subarchive} (owner {owner})"))
    }

    fn print_diagnostics(&self, runtime: &RuntimeOptions) {
        if runtime.diagnostics {
            println!("\n[diagnostics]\n{}", self.paths.diagnostics());
            println!("wiki_url={}", self.settings.wiki_url);
            println!("api_url={}", self.settings.api_url);
            println!("store_backend={}", self.settings.store_backend.as_str());
            println!("requests={}", self.archivist.fetcher().request_count());
        }
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Archives) => run_archives(&runtime),
        Some(Commands::Page(args)) => run_page(&runtime, args),
        Some(Commands::History(args)) => run_history(&runtime, args),
        Some(Commands::Watch(WatchArgs { command })) => match command {
            WatchSubcommand::Add {
                archive,
                subarchive,
                cutoff,
                owner,
            } => run_watch_add(&runtime, &archive, &subarchive, &cutoff, &owner.owner),
            WatchSubcommand::Check {
                archive,
                subarchive,
                tree,
                owner,
            } => run_watch_check(&runtime, &archive, &subarchive, tree, &owner.owner),
            WatchSubcommand::Resolve {
                address,
                deep,
                owner,
            } => run_watch_resolve(&runtime, &address, deep, &owner.owner),
            WatchSubcommand::Unresolve { address, owner } => {
                run_watch_unresolve(&runtime, &address, &owner.owner)
            }
            WatchSubcommand::List { owner } => run_watch_list(&runtime, &owner.owner),
            WatchSubcommand::Remove {
                archive,
                subarchive,
                owner,
            } => run_watch_remove(&runtime, &archive, &subarchive, &owner.owner),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging() {
    let default_level = "info";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            materialize_catalog: args.catalog,
            force: args.force,
        },
    )?;

    println!("Initialized archivewatch runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("store_dir: {}", normalize_path(&paths.store_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("catalog_path: {}", normalize_path(&paths.catalog_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("wrote_catalog: {}", report.wrote_catalog);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_archives(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let catalog = paths.load_catalog()?;
    for (tag, subarchive) in catalog.all_archives() {
        let name = catalog.archive_name(&tag).unwrap_or_default();
        println!("{tag}-{subarchive}: {name}");
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_page(runtime: &RuntimeOptions, args: PageArgs) -> Result<()> {
    let session = Session::open(runtime)?;
    let ctx = &session.archivist;
    let mut page = session.load_page(&args.address.address())?;

    if let Some(date) = &args.as_of
        && !page.revert_to(ctx, date)?
    {
        bail!("{} has no version at or before {date}", page.name());
    }
    if args.translate {
        translate_page(&session, &mut page)?;
    }
    let page = match &args.compare {
        Some(date) => {
            page.compare_with(ctx, date)?
                .with_context(|| format!("{} has no version at or before {date}", page.name()))?
        }
        None => page,
    };

    if args.json {
        let snapshot = page
            .snapshot()
            .with_context(|| format!("{} has no content", page.name()))?;
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    println!("name: {}", page.name());
    println!("kind: {}", page.kind());
    println!("url: {}", page.url().unwrap_or("<none>"));
    println!("title: {}", page.title());
    println!("description: {}", page.description());
    println!("lastmod: {}", page.lastmod().unwrap_or("<none>"));
    if let Some(refmod) = page.refmod() {
        println!("compared_with: {refmod}");
    }
    if let Some(link) = page.document_link() {
        println!("document: {link}");
    }
    if let Some(short) = page.shortname() {
        println!("shortname: {short}");
    }
    println!("needs_translation: {}", format_flag(page.needs_translation()));
    println!("rows: {}", page.rows().len());
    match page.snapshot().and_then(Snapshot::change_report) {
        Some(report) => println!("{report}"),
        None => {
            for row in page.rows() {
                let cells = row
                    .iter()
                    .map(|cell| cell.text.get_text())
                    .collect::<Vec<_>>()
                    .join(" | ");
                println!("  {cells}");
            }
        }
    }
    session.print_diagnostics(runtime);
    Ok(())
}

fn translate_page(session: &Session, page: &mut Page) -> Result<()> {
    let Some(endpoint) = &session.settings.translate_endpoint else {
        bail!("no translation endpoint configured; set [translate] endpoint or ARCHIVEWATCH_TRANSLATE_ENDPOINT");
    };
    let translator = HttpTranslator::new(
        endpoint,
        session.settings.translate_api_key.clone(),
        &session.settings.http,
    )?;
    let queue = TranslationQueue::new(
        Arc::new(translator),
        session.settings.translate_workers,
        session.settings.translate_chunk_size,
    );
    let name = page.name();
    let progress: ProgressCallback = Arc::new(move |task, done, total| {
        info!(page = %name, %task, done, total, "translation progress");
    });
    if let Some(task) = page.translate_async(&session.archivist, &queue, Some(progress))? {
        page.set_snapshot(task.wait()?);
    }
    Ok(())
}

fn run_history(runtime: &RuntimeOptions, args: HistoryArgs) -> Result<()> {
    let session = Session::open(runtime)?;
    let ctx = &session.archivist;
    let page = session.load_page(&args.address.address())?;
    let history = match &args.since {
        Some(date) => page.history_since(ctx, date)?,
        None => page.history(ctx, args.max.unwrap_or(50))?,
    };
    let history = match args.max {
        Some(max) => compress_history(&history, max),
        None => history,
    };

    println!("name: {}", page.name());
    println!("revisions: {}", history.len());
    for entry in &history {
        let created = if entry.created { " (created)" } else { "" };
        println!("  {} {}{created}", entry.modified, entry.link);
    }
    session.print_diagnostics(runtime);
    Ok(())
}

fn run_watch_add(
    runtime: &RuntimeOptions,
    archive: &str,
    subarchive: &str,
    cutoff: &str,
    owner: &str,
) -> Result<()> {
    let session = Session::open(runtime)?;
    let (archive, subarchive) = session.archive_pair(archive, subarchive)?;
    let watchers = session.watchers(owner);
    if watchers.load(&archive, &subarchive)?.is_some() {
        bail!("watcher for {archive}-{subarchive} already exists (owner {owner})");
    }
    let mut watcher = ArchiveWatcher::new(&archive, &subarchive, cutoff);
    watchers.save(&watcher)?;
    let report = watcher.check(&session.archivist)?;
    watchers.save(&watcher)?;

    println!("watcher: {archive}-{subarchive}");
    println!("owner: {owner}");
    println!("cutoff_date: {}", watcher.cutoff_date());
    print_check_report(&watcher, report.observed, report.newly_unresolved);
    session.print_diagnostics(runtime);
    Ok(())
}

fn run_watch_check(
    runtime: &RuntimeOptions,
    archive: &str,
    subarchive: &str,
    tree: bool,
    owner: &str,
) -> Result<()> {
    let session = Session::open(runtime)?;
    let mut watcher = session.load_watcher(owner, archive, subarchive)?;
    let report = watcher.check(&session.archivist)?;
    session.watchers(owner).save(&watcher)?;

    println!("watcher: {}-{}", watcher.archive(), watcher.subarchive());
    print_check_report(&watcher, report.observed, report.newly_unresolved);
    println!("ancestors_checked: {}", format_flag(report.ancestors_checked));
    if tree {
        for node in watcher.unresolved_tree() {
            print_tree(&node, 1);
        }
    } else {
        for (key, change) in watcher.unresolved() {
            println!("  {key} {} (since {})", change.modified, change.last_resolved);
        }
    }
    session.print_diagnostics(runtime);
    Ok(())
}

fn print_check_report(watcher: &ArchiveWatcher, observed: usize, newly_unresolved: usize) {
    println!(
        "last_checked_date: {}",
        watcher.last_checked_date().unwrap_or("<never>")
    );
    println!("observed: {observed}");
    println!("newly_unresolved: {newly_unresolved}");
    println!("unresolved: {}", watcher.unresolved().len());
}

fn print_tree(node: &UnresolvedNode, depth: usize) {
    let indent = "  ".repeat(depth);
    match &node.change {
        Some(change) => println!("{indent}{} {}", node.name, change.modified),
        None => println!("{indent}{}", node.name),
    }
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

fn run_watch_resolve(
    runtime: &RuntimeOptions,
    address: &AddressArgs,
    deep: bool,
    owner: &str,
) -> Result<()> {
    let session = Session::open(runtime)?;
    let mut watcher = session.load_watcher(owner, &address.archive, &address.subarchive)?;
    let key = session.archivist.canonical_address(&address.address()).path();
    let resolved = watcher.resolve(&key, deep);
    session.watchers(owner).save(&watcher)?;

    println!("address: {key}");
    println!("resolved: {resolved}");
    println!("unresolved: {}", watcher.unresolved().len());
    Ok(())
}

fn run_watch_unresolve(runtime: &RuntimeOptions, address: &AddressArgs, owner: &str) -> Result<()> {
    let session = Session::open(runtime)?;
    let mut watcher = session.load_watcher(owner, &address.archive, &address.subarchive)?;
    let key = session.archivist.canonical_address(&address.address()).path();
    let reopened = watcher.unresolve(&key);
    session.watchers(owner).save(&watcher)?;

    println!("address: {key}");
    println!("unresolved_again: {}", format_flag(reopened));
    println!("unresolved: {}", watcher.unresolved().len());
    Ok(())
}

fn run_watch_list(runtime: &RuntimeOptions, owner: &str) -> Result<()> {
    let session = Session::open(runtime)?;
    let watchers = session.watchers(owner);
    let entries = watchers.list()?;
    println!("owner: {owner}");
    println!("watchers: {}", entries.len());
    for (archive, subarchive) in entries {
        let Some(watcher) = watchers.load(&archive, &subarchive)? else {
            continue;
        };
        println!(
            "  {archive}-{subarchive} cutoff={} last_checked={} unresolved={}",
            watcher.cutoff_date(),
            watcher.last_checked_date().unwrap_or("<never>"),
            watcher.unresolved().len()
        );
    }
    Ok(())
}

fn run_watch_remove(
    runtime: &RuntimeOptions,
    archive: &str,
    subarchive: &str,
    owner: &str,
) -> Result<()> {
    let session = Session::open(runtime)?;
    let (archive, subarchive) = session.archive_pair(archive, subarchive)?;
    session.watchers(owner).remove(&archive, &subarchive)?;
    println!("removed: {archive}-{subarchive}");
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn parse_date(value: &str) -> Result<String, String> {
    normalize_date_input(value).map_err(|error| error.to_string())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
