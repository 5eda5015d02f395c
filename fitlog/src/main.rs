use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use fitlog::config::Config;
use fitlog::diagnose::probe;
use fitlog::model::{AppState, DateKey, Entry, EntryField, ItemId, MealSlot, Settings, Weekday};
use fitlog::ops::{
    add_checklist_item, ensure_entry, reapply_template, remove_checklist_item, reset_entry,
    set_weekly_music_url, toggle_checklist_item, update_field, update_meals, with_settings,
};
use fitlog::prefetch::{Prefetcher, spawn_worker, weekly_music_request};
use fitlog::projectors::{DateRange, completion, weight_trend};
use fitlog::storage::FileRepository;
use fitlog::store::{Store, export_file_name};
use fitlog::{canonical_date_key, today_key, weekday_label};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "fitlog",
    about = "Daily weight, meal and workout log with weekly templates",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Directory holding the state file.
    #[arg(long, global = true, env = "FITLOG_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Directory holding prefetched media.
    #[arg(long, global = true, env = "FITLOG_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show a day, creating it from the weekday template if needed.
    Show(ShowArgs),

    /// Record the day's weight.
    Weight(WeightArgs),

    /// Set the text of a meal slot.
    Meal(MealArgs),

    /// Toggle a checklist item by position, id or id prefix.
    Check(ItemArgs),

    /// Append a checklist item.
    Add(AddArgs),

    /// Remove a checklist item by position, id or id prefix.
    Remove(ItemArgs),

    /// Discard the day and rebuild it from the template.
    Reset(DayArgs),

    /// Rebuild only the day's checklist from the template.
    Reapply(DayArgs),

    /// Set the goal weight.
    Goal(GoalArgs),

    /// Replace a weekday's checklist template.
    Template(TemplateArgs),

    /// Weekly music links.
    Music {
        #[command(subcommand)]
        command: MusicCommands,
    },

    /// Write the whole state to a dated JSON file.
    Export(ExportArgs),

    /// Replace the whole state with a previously exported file.
    Import(ImportArgs),

    /// Summarize weight and checklist completion over a date range.
    Trend(TrendArgs),
}

#[derive(Debug, Subcommand)]
enum MusicCommands {
    /// Store the link for a weekday; blank clears it.
    Set {
        weekday: Weekday,
        #[arg(default_value = "")]
        url: String,
    },
    /// List the link for every weekday.
    Show,
    /// Probe a weekday's link (or any URL) and explain playback problems.
    Diagnose { target: String },
    /// Download every weekly link into the cache directory.
    Prefetch,
}

#[derive(Debug, Args)]
struct DayArgs {
    /// Day to act on (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[command(flatten)]
    day: DayArgs,
    /// Emit JSON instead of a human-readable summary.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct WeightArgs {
    #[command(flatten)]
    day: DayArgs,
    /// Weight as typed, e.g. `72.4` or `72,4`; empty clears it.
    #[arg(default_value = "")]
    value: String,
}

#[derive(Debug, Args)]
struct MealArgs {
    #[command(flatten)]
    day: DayArgs,
    /// breakfast, lunch, dinner or notes.
    slot: MealSlot,
    /// Meal text; omit to clear.
    text: Vec<String>,
}

#[derive(Debug, Args)]
struct ItemArgs {
    #[command(flatten)]
    day: DayArgs,
    /// 1-based position, full id or unique id prefix.
    item: String,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[command(flatten)]
    day: DayArgs,
    #[arg(required = true)]
    text: Vec<String>,
}

#[derive(Debug, Args)]
struct GoalArgs {
    weight: f64,
}

#[derive(Debug, Args)]
struct TemplateArgs {
    weekday: Weekday,
    /// One argument per checklist line; none clears the template.
    lines: Vec<String>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Directory to write the export into. Defaults to the current directory.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    file: PathBuf,
}

#[derive(Debug, Args)]
struct TrendArgs {
    /// Inclusive start date (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Emit JSON instead of a human-readable summary.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = Config::resolve(cli.data_dir, cli.cache_dir)?;
    debug!(state = ?config.state_path(), cache = ?config.cache_dir, "resolved directories");
    let mut store = Store::open(FileRepository::in_dir(&config.data_dir));

    match cli.command {
        Commands::Show(args) => handle_show(&mut store, args),
        Commands::Weight(args) => {
            let key = day_key(args.day.date);
            let value = args.value.trim().to_string();
            store.apply(|s| update_field(s, &key, EntryField::Weight, value))?;
            print_day(&store, &key)
        }
        Commands::Meal(args) => {
            let key = day_key(args.day.date);
            let text = args.text.join(" ");
            store.apply(|s| update_meals(s, &key, args.slot, text))?;
            print_day(&store, &key)
        }
        Commands::Check(args) => {
            let key = day_key(args.day.date);
            let id = find_item(&mut store, &key, &args.item)?;
            store.apply(|s| toggle_checklist_item(s, &key, &id))?;
            print_day(&store, &key)
        }
        Commands::Add(args) => {
            let key = day_key(args.day.date);
            let text = args.text.join(" ");
            store.apply(|s| add_checklist_item(s, &key, &text))?;
            print_day(&store, &key)
        }
        Commands::Remove(args) => {
            let key = day_key(args.day.date);
            let id = find_item(&mut store, &key, &args.item)?;
            store.apply(|s| remove_checklist_item(s, &key, &id))?;
            print_day(&store, &key)
        }
        Commands::Reset(args) => {
            let key = day_key(args.date);
            store.apply(|s| reset_entry(s, &key))?;
            print_day(&store, &key)
        }
        Commands::Reapply(args) => {
            let key = day_key(args.date);
            store.apply(|s| reapply_template(s, &key))?;
            print_day(&store, &key)
        }
        Commands::Goal(args) => handle_goal(&mut store, args),
        Commands::Template(args) => handle_template(&mut store, args),
        Commands::Music { command } => handle_music(&mut store, &config, command),
        Commands::Export(args) => handle_export(&store, args),
        Commands::Import(args) => handle_import(&mut store, args),
        Commands::Trend(args) => handle_trend(store.snapshot(), args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn day_key(date: Option<NaiveDate>) -> DateKey {
    date.map(canonical_date_key).unwrap_or_else(today_key)
}

fn handle_show(store: &mut Store<FileRepository>, args: ShowArgs) -> Result<()> {
    let key = day_key(args.day.date);
    store.apply(|s| ensure_entry(s, &key))?;
    if args.json {
        let entry = store.snapshot().entry(&key);
        let text = serde_json::to_string_pretty(&entry).context("serializing entry")?;
        println!("{text}");
        return Ok(());
    }
    print_day(store, &key)
}

fn print_day(store: &Store<FileRepository>, key: &DateKey) -> Result<()> {
    let state = store.snapshot();
    let entry = state
        .entry(key)
        .with_context(|| format!("no entry for {key}"))?;
    println!("{}", render_entry(entry, &state.settings));
    Ok(())
}

/// Make sure the day exists, then resolve `target` against its checklist.
fn find_item(store: &mut Store<FileRepository>, key: &DateKey, target: &str) -> Result<ItemId> {
    store.apply(|s| ensure_entry(s, key))?;
    let entry = store
        .snapshot()
        .entry(key)
        .with_context(|| format!("no entry for {key}"))?;
    resolve_item(entry, target)
}

fn resolve_item(entry: &Entry, target: &str) -> Result<ItemId> {
    let target = target.trim();
    if let Ok(position) = target.parse::<usize>() {
        if let Some(item) = position
            .checked_sub(1)
            .and_then(|index| entry.checklist.get(index))
        {
            return Ok(item.id.clone());
        }
    }
    if let Some(item) = entry.checklist.iter().find(|item| item.id.0 == target) {
        return Ok(item.id.clone());
    }
    let matches: Vec<&ItemId> = entry
        .checklist
        .iter()
        .map(|item| &item.id)
        .filter(|id| !target.is_empty() && id.0.starts_with(target))
        .collect();
    match matches.as_slice() {
        [id] => Ok((*id).clone()),
        [] => anyhow::bail!("no checklist item matches {target:?} on {}", entry.date),
        _ => anyhow::bail!(
            "{target:?} matches {} checklist items on {}; use more of the id",
            matches.len(),
            entry.date
        ),
    }
}

fn render_entry(entry: &Entry, settings: &Settings) -> String {
    let weekday = weekday_label(&entry.date);
    let mut out = match weekday {
        Some(day) => format!("{} ({})\n", entry.date, day.display_name()),
        None => format!("{}\n", entry.date),
    };

    let weight = if entry.weight.is_empty() {
        "-"
    } else {
        entry.weight.as_str()
    };
    out.push_str(&format!("Weight: {weight} (goal {})\n", settings.goal_weight));
    for slot in MealSlot::ALL {
        let text = entry.meals.get(slot);
        if !text.is_empty() {
            out.push_str(&format!("{}: {text}\n", capitalize(slot.name())));
        }
    }

    let (done, total) = entry.progress();
    out.push_str(&format!("Checklist {done}/{total}:\n"));
    for (index, item) in entry.checklist.iter().enumerate() {
        let mark = if item.done { 'x' } else { ' ' };
        out.push_str(&format!("  {}. [{mark}] {}  ({})\n", index + 1, item.text, item.id));
    }

    if let Some(day) = weekday {
        let music = settings.weekly_music.get(day);
        if !music.is_empty() {
            out.push_str(&format!("Music: {music}\n"));
        }
    }
    out.trim_end().to_string()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn handle_goal(store: &mut Store<FileRepository>, args: GoalArgs) -> Result<()> {
    if !args.weight.is_finite() || args.weight <= 0.0 {
        anyhow::bail!("goal weight must be a positive number, got {}", args.weight);
    }
    store.apply(|s| {
        with_settings(s, |mut settings| {
            settings.set_goal_weight(args.weight);
            settings
        })
    })?;
    println!("Goal weight set to {}", args.weight);
    Ok(())
}

fn handle_template(store: &mut Store<FileRepository>, args: TemplateArgs) -> Result<()> {
    let TemplateArgs { weekday, lines } = args;
    let state = store.apply(|s| {
        with_settings(s, |mut settings| {
            settings.set_template(weekday, &lines);
            settings
        })
    })?;
    println!("{} template:", weekday.display_name());
    for line in state.settings.templates.get(weekday) {
        println!("  - {line}");
    }
    Ok(())
}

fn handle_music(
    store: &mut Store<FileRepository>,
    config: &Config,
    command: MusicCommands,
) -> Result<()> {
    match command {
        MusicCommands::Set { weekday, url } => {
            let state =
                store.apply(|s| with_settings(s, |st| set_weekly_music_url(st, weekday, &url)))?;
            let stored = state.settings.weekly_music.get(weekday);
            if stored.is_empty() {
                println!("{}: cleared", weekday.display_name());
            } else {
                println!("{}: {stored}", weekday.display_name());
            }
            Ok(())
        }
        MusicCommands::Show => {
            for (day, url) in store.snapshot().settings.weekly_music.iter() {
                let url = if url.is_empty() { "-" } else { url.as_str() };
                println!("{:<9} {url}", day.display_name());
            }
            Ok(())
        }
        MusicCommands::Diagnose { target } => {
            let url = match Weekday::from_label(&target) {
                Some(day) => {
                    let url = store.snapshot().settings.weekly_music.get(day).clone();
                    if url.is_empty() {
                        anyhow::bail!("no music link stored for {}", day.display_name());
                    }
                    url
                }
                None => target,
            };
            let client = http_client()?;
            let report = runtime()?.block_on(probe(&client, &url));
            println!("{}", report.summary());
            Ok(())
        }
        MusicCommands::Prefetch => {
            let Some(request) = weekly_music_request(&store.snapshot().settings) else {
                println!("No weekly music links to prefetch.");
                return Ok(());
            };
            let client = http_client()?;
            let cache_dir = config.cache_dir.clone();
            let summary = runtime()?.block_on(async move {
                let (tx, worker) = spawn_worker(client, cache_dir);
                tx.request(request);
                drop(tx);
                worker.await
            });
            let summary = summary.context("prefetch worker stopped unexpectedly")?;
            for path in &summary.cached {
                println!("cached {}", path.display());
            }
            for (url, err) in &summary.failed {
                println!("failed {url}: {err}");
            }
            Ok(())
        }
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()
        .context("building HTTP client")
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting async runtime")
}

fn handle_export(store: &Store<FileRepository>, args: ExportArgs) -> Result<()> {
    let path = export_to(store, args.output.unwrap_or_else(|| PathBuf::from(".")), &today_key())?;
    println!("Exported to {}", path.display());
    Ok(())
}

fn export_to(store: &Store<FileRepository>, dir: PathBuf, today: &DateKey) -> Result<PathBuf> {
    fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", dir))?;
    let path = dir.join(export_file_name(today));
    let text = store.export_json()?;
    fs::write(&path, text).with_context(|| format!("writing {:?}", path))?;
    Ok(path)
}

fn handle_import(store: &mut Store<FileRepository>, args: ImportArgs) -> Result<()> {
    let text =
        fs::read_to_string(&args.file).with_context(|| format!("reading {:?}", args.file))?;
    let state = store
        .import_json(&text)
        .with_context(|| format!("importing {:?}", args.file))?;
    println!("Imported {} entries", state.entries.len());
    Ok(())
}

fn handle_trend(state: &AppState, args: TrendArgs) -> Result<()> {
    let range = DateRange {
        from: args.from.map(canonical_date_key),
        to: args.to.map(canonical_date_key),
    };
    let trend = weight_trend::project(state, &range);
    let done = completion::project(state, &range);

    if args.json {
        let payload = serde_json::json!({ "weight": trend, "completion": done });
        let text = serde_json::to_string_pretty(&payload).context("serializing trend")?;
        println!("{text}");
        return Ok(());
    }

    if trend.points.is_empty() {
        println!("No weights recorded in range.");
    } else {
        for point in &trend.points {
            println!("{}  {:.1}", point.date, point.weight);
        }
        if let (Some(change), Some(min), Some(max)) = (trend.change, trend.min, trend.max) {
            println!("change {change:+.1}  min {min:.1}  max {max:.1}");
        }
        if let Some(to_goal) = trend.to_goal {
            println!("{to_goal:+.1} from goal {}", trend.goal);
        }
    }
    match done.ratio {
        Some(ratio) => println!(
            "Checklist: {}/{} done ({:.0}%)",
            done.done,
            done.total,
            ratio * 100.0
        ),
        None => println!("Checklist: nothing planned in range."),
    }
    Ok(())
}
