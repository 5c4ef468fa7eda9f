use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use memorial_gallery_core::{
    distinct_governorates, distinct_tags, parse_dataset, query, DatasetWarning, FilterCriteria,
    GroupedView, Language, LoadPolicy, MemorialRecord, ProminenceTier, QueryCache, RecordCard,
    RejectedRecord, KNOWN_GOVERNORATES,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "gallery.v1";

#[derive(Debug, Parser)]
#[command(name = "gallery")]
#[command(about = "Memorial gallery query CLI")]
struct Cli {
    #[arg(long, env = "GALLERY_DATASET", default_value = "./data/memorials.json")]
    dataset: PathBuf,

    #[arg(long, value_enum, default_value_t = LangArg::Ar)]
    lang: LangArg,

    /// Drop malformed records instead of rejecting the whole dataset.
    #[arg(long, default_value_t = false)]
    skip_invalid: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Filter, group and sort the collection.
    Query(QueryArgs),
    /// Show the detail card of one record.
    Show(ShowArgs),
    /// List filter vocabularies (tags, governorates, tiers).
    Vocabulary,
    /// Report rejected records and content warnings.
    Lint,
    /// Answer one JSON criteria object per stdin line.
    Session,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long, default_value = "")]
    text: String,
    #[arg(long, default_value = "")]
    governorate: String,
    #[arg(long)]
    age_min: Option<u32>,
    #[arg(long)]
    age_max: Option<u32>,
    #[arg(long)]
    date_start: Option<String>,
    #[arg(long)]
    date_end: Option<String>,
    #[arg(long, default_value = "")]
    tag: String,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long, conflicts_with = "id", required_unless_present = "id")]
    index: Option<usize>,
    #[arg(long)]
    id: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LangArg {
    Ar,
    En,
}

impl LangArg {
    fn into_language(self) -> Language {
        match self {
            Self::Ar => Language::Arabic,
            Self::En => Language::English,
        }
    }
}

impl QueryArgs {
    fn into_criteria(self) -> FilterCriteria {
        FilterCriteria {
            text: self.text,
            governorate: self.governorate,
            age_min: self.age_min,
            age_max: self.age_max,
            date_start: self.date_start,
            date_end: self.date_end,
            tag: self.tag,
        }
    }
}

struct Dataset {
    records: Vec<MemorialRecord>,
    rejected: Vec<RejectedRecord>,
    warnings: Vec<DatasetWarning>,
    digest: String,
}

fn with_contract_version(value: Value, dataset_digest: &str) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert("dataset_digest".to_string(), Value::String(dataset_digest.to_string()));
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "dataset_digest": dataset_digest,
            "payload": other
        }),
    }
}

fn emit_json(value: Value, dataset: &Dataset) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value, &dataset.digest))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // Logs go to stderr; stdout carries only JSON.
    let installed =
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).try_init();
    if installed.is_err() {
        eprintln!("tracing subscriber already installed");
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let language = cli.lang.into_language();

    // Lint reports every malformed record instead of stopping at the first one.
    let policy = if cli.skip_invalid || matches!(cli.command, Command::Lint) {
        LoadPolicy::SkipInvalid
    } else {
        LoadPolicy::Strict
    };
    let dataset = load_dataset(&cli.dataset, policy)?;

    match cli.command {
        Command::Query(args) => run_query(args.into_criteria(), language, &dataset),
        Command::Show(args) => run_show(&args, language, &dataset),
        Command::Vocabulary => run_vocabulary(language, &dataset),
        Command::Lint => run_lint(&dataset),
        Command::Session => run_session(language, &dataset),
    }
}

fn load_dataset(path: &Path, policy: LoadPolicy) -> Result<Dataset> {
    let body =
        fs::read(path).with_context(|| format!("failed to read dataset {}", path.display()))?;
    let digest = dataset_digest(&body);
    let json = std::str::from_utf8(&body)
        .with_context(|| format!("dataset {} is not valid UTF-8", path.display()))?;
    let report = parse_dataset(json, policy)
        .with_context(|| format!("failed to load dataset {}", path.display()))?;

    info!(
        dataset = %path.display(),
        records = report.records.len(),
        rejected = report.rejected.len(),
        %digest,
        "dataset ready"
    );

    Ok(Dataset {
        records: report.records,
        rejected: report.rejected,
        warnings: report.warnings,
        digest,
    })
}

fn dataset_digest(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("sha256:{digest:x}")
}

fn grouped_output(criteria: &FilterCriteria, view: &GroupedView) -> Result<Value> {
    let mut value = serde_json::to_value(view).context("failed to serialize grouped view")?;
    if let Value::Object(object) = &mut value {
        object.insert(
            "criteria".to_string(),
            serde_json::to_value(criteria).context("failed to serialize criteria")?,
        );
    }
    Ok(value)
}

fn run_query(criteria: FilterCriteria, language: Language, dataset: &Dataset) -> Result<()> {
    let result = query(&dataset.records, &criteria);
    debug!(matches = result.len(), tiers = result.sorted_tiers.len(), "query evaluated");
    let view = GroupedView::localize(&dataset.records, &result, language);
    emit_json(grouped_output(&criteria, &view)?, dataset)
}

fn run_show(args: &ShowArgs, language: Language, dataset: &Dataset) -> Result<()> {
    let cards = match (args.index, args.id.as_deref()) {
        (Some(index), _) => {
            let record = dataset.records.get(index).ok_or_else(|| {
                anyhow!(
                    "no record at position {index} (dataset has {} records)",
                    dataset.records.len()
                )
            })?;
            vec![RecordCard::localize(index, record, language)]
        }
        (None, Some(id)) => {
            // Ids are not unique; every record carrying the id is returned.
            let cards = dataset
                .records
                .iter()
                .enumerate()
                .filter(|(_, record)| record.id == id)
                .map(|(index, record)| RecordCard::localize(index, record, language))
                .collect::<Vec<_>>();
            if cards.is_empty() {
                return Err(anyhow!("no record with id `{id}`"));
            }
            cards
        }
        (None, None) => return Err(anyhow!("either --index or --id MUST be provided")),
    };

    emit_json(serde_json::json!({ "language": language, "records": cards }), dataset)
}

fn run_vocabulary(language: Language, dataset: &Dataset) -> Result<()> {
    let tiers = ProminenceTier::ALL
        .iter()
        .map(|tier| {
            serde_json::json!({
                "level": tier.level(),
                "key": tier.as_str(),
                "name": tier.name(language),
            })
        })
        .collect::<Vec<_>>();

    emit_json(
        serde_json::json!({
            "language": language,
            "tags": distinct_tags(&dataset.records),
            "governorates": distinct_governorates(&dataset.records),
            "known_governorates": KNOWN_GOVERNORATES,
            "tiers": tiers,
        }),
        dataset,
    )
}

fn run_lint(dataset: &Dataset) -> Result<()> {
    emit_json(
        serde_json::json!({
            "record_count": dataset.records.len(),
            "clean": dataset.rejected.is_empty() && dataset.warnings.is_empty(),
            "rejected": dataset.rejected,
            "warnings": dataset.warnings,
        }),
        dataset,
    )
}

fn run_session(language: Language, dataset: &Dataset) -> Result<()> {
    let mut cache = QueryCache::new(&dataset.records);
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for (line_number, line) in stdin.lock().lines().enumerate() {
        let line = line.context("failed to read criteria from stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<FilterCriteria>(&line) {
            Ok(criteria) => {
                let result = cache.query(&criteria);
                let view = GroupedView::localize(&dataset.records, result, language);
                let mut value = grouped_output(&criteria, &view)?;
                if let Value::Object(object) = &mut value {
                    object.insert(
                        "cache".to_string(),
                        serde_json::to_value(cache.stats()).context("failed to serialize cache stats")?,
                    );
                }
                value
            }
            Err(err) => serde_json::json!({ "error": format!("invalid criteria: {err}") }),
        };

        let mut response = with_contract_version(response, &dataset.digest);
        if let Value::Object(object) = &mut response {
            object.insert("line".to_string(), Value::from(line_number + 1));
        }
        writeln!(stdout, "{}", serde_json::to_string(&response)?)
            .context("failed to write session response")?;
    }

    debug!(stats = ?cache.stats(), "session finished");
    Ok(())
}
