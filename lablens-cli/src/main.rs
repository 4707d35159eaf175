use std::io;
use std::path::PathBuf;

use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use lablens_common::Config;
use lablens_core::{
    compile, stats, CompiledFilter, FilterExpression, MemoryExecutor, ParquetFactSource,
    QueryExecutor, QueryOptions, Relation, ViewStore,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lablens", version, about = "Lab results cohort filters, panels and repeats")]
struct Cli {
    /// overrides storage.data_dir from the config file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a filter expression (JSON, or @file) to predicate text and args
    Compile { filter: String },
    /// Load fact rows from a parquet file, directory or glob and publish new views
    Rebuild { input: String },
    /// Run a filter against the published generation
    Query {
        #[arg(long, default_value = "{}")]
        filter: String,
        #[arg(long, value_enum, default_value = "results")]
        relation: RelationArg,
        #[arg(long)] limit: Option<usize>,
        #[arg(long, default_value_t = 0)] offset: usize,
        #[arg(long)] sort_by: Option<String>,
        #[arg(long)] order: Option<String>,
        #[arg(long)] count: bool,
    },
    /// Panels of one patient, by date
    Panels { patient: String },
    /// Repeated tests, for one patient or the most repeated overall
    Repeats {
        #[arg(long)] patient: Option<String>,
        #[arg(long, default_value_t = 20)] top: usize,
    },
    /// Dataset, cohort or per-test statistics as JSON
    Summary {
        #[arg(long)] filter: Option<String>,
        #[arg(long)] test: Option<String>,
        #[arg(long, default_value_t = 10)] pairs: usize,
    },
    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum RelationArg {
    Results,
    Panels,
    Repeats,
}

impl From<RelationArg> for Relation {
    fn from(r: RelationArg) -> Self {
        match r {
            RelationArg::Results => Relation::Results,
            RelationArg::Panels => Relation::Panels,
            RelationArg::Repeats => Relation::Repeats,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load().unwrap_or_default();
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.to_string_lossy().into_owned();
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)))
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Compile { filter } => run_compile(&filter)?,
        Commands::Rebuild { input } => run_rebuild(&input, &config)?,
        Commands::Query { filter, relation, limit, offset, sort_by, order, count } => {
            let options = QueryOptions { limit, offset, sort_by, order };
            run_query(&filter, relation.into(), &options, count, &config)?
        }
        Commands::Panels { patient } => run_panels(&patient, &config)?,
        Commands::Repeats { patient, top } => run_repeats(patient.as_deref(), top, &config)?,
        Commands::Summary { filter, test, pairs } => run_summary(filter.as_deref(), test.as_deref(), pairs, &config)?,
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "lablens", &mut io::stdout());
        }
    }
    Ok(())
}

// `@path` reads the expression from a file
fn parse_filter(arg: &str) -> anyhow::Result<CompiledFilter> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_owned(),
    };
    let expr = FilterExpression::from_json(&text)?;
    Ok(compile(&expr)?)
}

fn open_store(config: &Config) -> anyhow::Result<ViewStore> {
    Ok(ViewStore::open(config.storage.clone(), config.pipeline.rebuild_policy, config.pipeline.batch_size)?)
}

fn print_batch(batch: &RecordBatch) -> anyhow::Result<()> {
    println!("{}", pretty_format_batches(std::slice::from_ref(batch))?);
    Ok(())
}

fn run_compile(filter: &str) -> anyhow::Result<()> {
    let compiled = parse_filter(filter)?;
    let doc = serde_json::json!({ "predicate": compiled.predicate, "args": compiled.args });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn run_rebuild(input: &str, config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let source = ParquetFactSource::new(input, config.pipeline.batch_size);
    let published = store.rebuild(&source)?;
    println!("{:<20} {}", "generation:", published.generation);
    println!("{:<20} {}", "rows:", published.snapshot.len());
    println!("{:<20} {}", "unparseable dates:", published.snapshot.unparseable_dates());
    println!("{:<20} {}", "panels:", published.views.panels().len());
    println!("{:<20} {}", "repeats:", published.views.repeats().len());
    if let Some(dir) = &published.location {
        println!("{:<20} {}", "written to:", dir.display());
    }
    Ok(())
}

fn run_query(filter: &str, relation: Relation, options: &QueryOptions, count_only: bool, config: &Config) -> anyhow::Result<()> {
    let compiled = parse_filter(filter)?;
    let store = open_store(config)?;
    let executor = MemoryExecutor::new(store.current(), config.query.clone())?;
    if count_only {
        println!("{}", executor.count(relation, &compiled)?);
        return Ok(());
    }
    let page = executor.select(relation, &compiled, options)?;
    print_batch(&page.rows)?;
    println!(
        "{} of {} {} rows match (showing {} from offset {})",
        page.filtered,
        page.total,
        relation,
        page.rows.num_rows(),
        page.offset
    );
    Ok(())
}

fn run_panels(patient: &str, config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let current = store.current();
    let panels = current.views.patient_panels(patient);
    if panels.is_empty() {
        anyhow::bail!("no panels for patient {patient}");
    }
    for p in panels {
        println!("{}  {:>3}  {}", p.date, p.n_tests, p.tests.join(", "));
    }
    Ok(())
}

fn run_repeats(patient: Option<&str>, top: usize, config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let current = store.current();
    match patient {
        Some(p) => {
            for r in current.views.patient_repeats(p) {
                println!("{:<24} {:>4}  {} .. {}  ({} days)", r.test, r.repeat_count, r.first_date, r.last_date, r.days_span);
            }
        }
        None => {
            let doc = stats::top_repeated_tests(&current.views, top);
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

fn run_summary(filter: Option<&str>, test: Option<&str>, pairs: usize, config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let current = store.current();
    let snapshot = &current.snapshot;
    let doc = match (filter, test) {
        (Some(f), _) => serde_json::to_value(stats::cohort_stats(snapshot, &parse_filter(f)?)?)?,
        (None, Some(t)) => match stats::test_stats(snapshot, t) {
            Some(s) => serde_json::to_value(s)?,
            None => anyhow::bail!("test not found: {t}"),
        },
        (None, None) => {
            serde_json::json!({
                "generation": current.generation,
                "summary": stats::summary(snapshot),
                "panels": stats::panel_distribution(&current.views),
                "top_coordered_pairs": stats::top_coordered_pairs(snapshot, pairs),
            })
        }
    };
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
