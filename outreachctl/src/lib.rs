use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use outreach_core::controller::{
    load_typed, proxy_sources, save_typed, BudgetState, Clock, Collaborators, ControllerError,
    HttpProbe, JsonFileStore, Orchestrator, PendingAction, PersistenceStore, PreviewDecision,
    PreviewEntry, ProcessedRecord, ProxyHealthReport, ProxyPool, ProxyProbe, RateBudget,
    RunReport, ScriptActionExecutor, SessionGuard, StopReason, SystemClock, BUDGET_KEY,
    PENDING_KEY, PROCESSED_KEY, PROXY_BLACKLIST_KEY,
};
use outreach_core::{load_controller_config, ControllerConfig};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] outreach_core::ConfigError),
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("run aborted: {0}")]
    RunAborted(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Outreach controller command-line interface", long_about = None)]
pub struct Cli {
    /// Caminho do outreach.toml
    #[arg(long, default_value = "configs/outreach.toml")]
    pub config: PathBuf,
    /// Diretório de estado (substitui orchestrator.state_dir)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
    /// Formato de saída
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Executa um ciclo do orquestrador sobre a fila pendente
    Run(RunArgs),
    /// Exibe orçamentos, sessão e últimas execuções
    Status,
    /// Mostra a decisão de admissão para cada ação pendente
    Preview,
    /// Operações sobre o pool de proxies
    #[command(subcommand)]
    Proxies(ProxyCommands),
    /// Gerencia a fila de ações pendentes
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Gera scripts de autocompletar para o shell
    Completions(CompletionArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Limite de ações tentadas neste ciclo (substitui max_actions_per_run)
    #[arg(long)]
    pub max_actions: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum ProxyCommands {
    /// Carrega as fontes e valida todos os proxies
    Check,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Adiciona uma ação à fila
    Add(QueueAddArgs),
    /// Lista ações pendentes ou processadas
    Show(QueueShowArgs),
}

#[derive(Args, Debug)]
pub struct QueueAddArgs {
    /// Identificador da ação (gerado quando omitido)
    #[arg(long)]
    pub id: Option<String>,
    /// Categoria usada para quotas
    #[arg(long)]
    pub category: String,
    /// Alvo da ação
    #[arg(long)]
    pub target: String,
    /// Payload JSON repassado ao executor
    #[arg(long)]
    pub payload: Option<String>,
}

#[derive(Args, Debug)]
pub struct QueueShowArgs {
    /// Lista registros processados em vez dos pendentes
    #[arg(long, default_value_t = false)]
    pub processed: bool,
    /// Limite de registros
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    /// Shell alvo
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "outreachctl", &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match &cli.command {
            Commands::Run(args) => {
                let report = context.run_cycle(args).await?;
                render(&report, cli.format)?;
                if let StopReason::Fatal { error } = &report.stop_reason {
                    return Err(AppError::RunAborted(error.clone()));
                }
            }
            Commands::Status => {
                let status = context.gather_status().await?;
                render(&status, cli.format)?;
            }
            Commands::Preview => {
                let preview = context.preview().await?;
                render(&preview, cli.format)?;
            }
            Commands::Proxies(ProxyCommands::Check) => {
                let report = context.proxies_check().await?;
                render(&report, cli.format)?;
            }
            Commands::Queue(QueueCommands::Add(args)) => {
                let added = context.queue_add(args).await?;
                render(&added, cli.format)?;
            }
            Commands::Queue(QueueCommands::Show(args)) => {
                let list = context.queue_show(args).await?;
                render(&list, cli.format)?;
            }
            Commands::Completions(_) => {}
        }
        Ok(())
    })
}

/// Installs the stderr log subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

struct AppContext {
    config: ControllerConfig,
    store: Arc<JsonFileStore>,
    metrics_db: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_controller_config(&cli.config)?;
        if let Some(dir) = &cli.state_dir {
            config.orchestrator.state_dir = dir.to_string_lossy().into_owned();
        }
        let store = Arc::new(JsonFileStore::new(&config.orchestrator.state_dir));
        let metrics_db = config.resolve_path(&config.observability.metrics_db);
        Ok(Self {
            config,
            store,
            metrics_db,
        })
    }

    fn executor(&self) -> Result<Arc<ScriptActionExecutor>> {
        Ok(Arc::new(ScriptActionExecutor::new(&self.config.orchestrator)?))
    }

    async fn run_cycle(&self, args: &RunArgs) -> Result<RunReport> {
        let mut config = self.config.clone();
        if let Some(limit) = args.max_actions {
            config.orchestrator.max_actions_per_run = limit;
        }
        let parts = Collaborators::from_config(&config, self.executor()?, self.store.clone())?;
        let mut orchestrator = Orchestrator::new(&config, parts);
        Ok(orchestrator.run().await?)
    }

    /// Read-only wiring: no telemetry, no solver, no proxy sources.
    fn offline_orchestrator(&self) -> Result<Orchestrator> {
        let probe: Arc<dyn ProxyProbe> = Arc::new(HttpProbe::new(
            self.config.proxy.probe_url.clone(),
            self.config.proxy.probe_timeout(),
        ));
        let parts = Collaborators {
            executor: self.executor()?,
            store: self.store.clone(),
            clock: Arc::new(SystemClock),
            probe,
            proxy_sources: Vec::new(),
            captcha_solver: None,
            telemetry: None,
        };
        Ok(Orchestrator::new(&self.config, parts))
    }

    async fn preview(&self) -> Result<PreviewList> {
        let mut orchestrator = self.offline_orchestrator()?;
        let rows = orchestrator.preview().await?;
        Ok(PreviewList { rows })
    }

    async fn gather_status(&self) -> Result<StatusReport> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = self.store.as_ref();

        let mut budget = RateBudget::new(
            self.config.limits.clone(),
            self.config.schedule.clone(),
            self.config.pacing.clone(),
            Arc::clone(&clock),
        );
        budget.restore(load_typed(store, BUDGET_KEY).await?);
        budget.reset_if_window_elapsed();
        let budgets = budget
            .snapshot()
            .into_iter()
            .map(|entry| BudgetStatus {
                state: budget.state(&entry.category),
                category: entry.category,
                daily_count: entry.daily_count,
                daily_limit: entry.daily_limit,
                weekly_count: entry.weekly_count,
                weekly_limit: entry.weekly_limit,
                backoff_multiplier: entry.backoff_multiplier,
            })
            .collect();

        let mut guard = SessionGuard::new(self.config.session.clone(), Arc::clone(&clock));
        let session = guard
            .load_persisted(store)
            .await?
            .map(|session| SessionSummary {
                cookies: session.cookies.keys().cloned().collect(),
                established_at: session.established_at,
            });

        let pending: Vec<PendingAction> = load_typed(store, PENDING_KEY).await?;
        let processed = store.load(PROCESSED_KEY).await?.len();
        let blacklisted: Vec<String> = load_typed(store, PROXY_BLACKLIST_KEY).await?;

        Ok(StatusReport {
            budgets,
            session,
            pending: pending.len(),
            processed,
            blacklisted,
            recent_runs: self.recent_runs(5).unwrap_or_default(),
        })
    }

    fn open_database(&self, path: &Path) -> Result<Connection> {
        if !path.exists() {
            return Err(AppError::InvalidInput(format!(
                "banco de dados ausente: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(conn)
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<RunEntry>> {
        let conn = self.open_database(&self.metrics_db)?;
        let mut stmt = conn.prepare(
            "SELECT ts, run_id, attempted, succeeded, failed, stop_reason \
             FROM controller_runs ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(RunEntry {
                    ts: row.get::<_, Option<String>>(0)?,
                    run_id: row.get(1)?,
                    attempted: row.get(2)?,
                    succeeded: row.get(3)?,
                    failed: row.get(4)?,
                    stop_reason: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn proxies_check(&self) -> Result<ProxyCheckReport> {
        let store = self.store.as_ref();
        let probe: Arc<dyn ProxyProbe> = Arc::new(HttpProbe::new(
            self.config.proxy.probe_url.clone(),
            self.config.proxy.probe_timeout(),
        ));
        let mut pool = ProxyPool::new(self.config.proxy.clone(), probe, Arc::new(SystemClock));
        let blacklist: Vec<String> = load_typed(store, PROXY_BLACKLIST_KEY).await?;
        pool.restore_blacklist(blacklist);
        let loaded = pool.load(&proxy_sources(&self.config)?).await;
        let health = pool.validate_all().await;
        save_typed(store, PROXY_BLACKLIST_KEY, &pool.blacklisted_identities()).await?;

        let proxies = pool
            .records()
            .iter()
            .map(|record| ProxyLine {
                identity: record.identity(),
                score: record.reliability_score,
                healthy: record.last_probe_ok,
                blacklisted: record.blacklisted,
            })
            .collect();
        Ok(ProxyCheckReport {
            loaded,
            health,
            proxies,
        })
    }

    async fn queue_add(&self, args: &QueueAddArgs) -> Result<QueueAddResult> {
        let category = args.category.trim();
        let target = args.target.trim();
        if category.is_empty() || target.is_empty() {
            return Err(AppError::InvalidInput(
                "categoria e alvo são obrigatórios".to_string(),
            ));
        }
        let id = match &args.id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => format!("act-{}", Utc::now().format("%Y%m%d%H%M%S%3f")),
        };

        let store = self.store.as_ref();
        let pending: Vec<PendingAction> = load_typed(store, PENDING_KEY).await?;
        if pending.iter().any(|action| action.id == id) {
            return Err(AppError::InvalidInput(format!("ação {id} já está na fila")));
        }

        let mut action = PendingAction::new(id.clone(), category, target);
        if let Some(raw) = &args.payload {
            action = action.with_payload(serde_json::from_str(raw)?);
        }
        store
            .append(PENDING_KEY, serde_json::to_value(&action)?)
            .await?;
        Ok(QueueAddResult {
            id,
            pending: pending.len() + 1,
        })
    }

    async fn queue_show(&self, args: &QueueShowArgs) -> Result<QueueList> {
        let store = self.store.as_ref();
        if args.processed {
            let mut processed: Vec<ProcessedRecord> = load_typed(store, PROCESSED_KEY).await?;
            let skip = processed.len().saturating_sub(args.limit);
            processed.drain(..skip);
            Ok(QueueList::Processed { rows: processed })
        } else {
            let mut pending: Vec<PendingAction> = load_typed(store, PENDING_KEY).await?;
            pending.truncate(args.limit);
            Ok(QueueList::Pending { rows: pending })
        }
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Execução {}", self.run_id),
            format!(
                "  - tentadas: {} | sucesso: {} | falhas: {} | ignoradas: {} | adiadas: {}",
                self.attempted, self.succeeded, self.failed, self.skipped, self.deferred
            ),
            format!("  - pendentes restantes: {}", self.remaining),
            format!("  - motivo de parada: {}", self.stop_reason),
        ];
        lines.push(format!(
            "  - detecções: {} | rotações: {} | retentativas: {}",
            self.metrics.detections, self.metrics.proxy_rotations, self.metrics.retries
        ));
        if self.metrics.captcha_attempts > 0 {
            lines.push(format!(
                "  - captcha: {}/{} resolvidos",
                self.metrics.captcha_solved, self.metrics.captcha_attempts
            ));
        }
        lines.push(format!("  - duração: {} ms", self.duration_ms));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PreviewList {
    pub rows: Vec<PreviewEntry>,
}

impl DisplayFallback for PreviewList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Fila vazia".to_string();
        }
        self.rows
            .iter()
            .map(|entry| {
                let decision = match &entry.decision {
                    PreviewDecision::Admit => "admitida".to_string(),
                    PreviewDecision::Defer { reason } => format!("adiada ({reason})"),
                    PreviewDecision::Stop { reason } => format!("parada ({reason})"),
                    PreviewDecision::BeyondRunLimit => "além do limite do ciclo".to_string(),
                    PreviewDecision::Invalid { reason } => format!("inválida ({reason})"),
                };
                format!(
                    "{} [{}] {} -> {}",
                    entry.action_id, entry.category, entry.target, decision
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub budgets: Vec<BudgetStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSummary>,
    pub pending: usize,
    pub processed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blacklisted: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_runs: Vec<RunEntry>,
}

#[derive(Debug, Serialize)]
pub struct BudgetStatus {
    pub category: String,
    pub daily_count: u32,
    pub daily_limit: u32,
    pub weekly_count: u32,
    pub weekly_limit: u32,
    pub backoff_multiplier: f64,
    pub state: BudgetState,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub cookies: Vec<String>,
    pub established_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct RunEntry {
    pub ts: Option<String>,
    pub run_id: String,
    pub attempted: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub stop_reason: String,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        if self.budgets.is_empty() {
            lines.push("Orçamentos: nenhum consumo registrado".to_string());
        } else {
            lines.push("Orçamentos:".to_string());
            for budget in &self.budgets {
                let state = match &budget.state {
                    BudgetState::Normal => "normal".to_string(),
                    BudgetState::Backoff { detections } => format!("backoff ({detections} detecções)"),
                    BudgetState::Cooldown { until } => format!("cooldown até {}", until.to_rfc3339()),
                };
                lines.push(format!(
                    "  - {}: dia {}/{} | semana {}/{} | x{:.0} | {}",
                    budget.category,
                    budget.daily_count,
                    budget.daily_limit,
                    budget.weekly_count,
                    budget.weekly_limit,
                    budget.backoff_multiplier,
                    state
                ));
            }
        }
        match &self.session {
            Some(session) => lines.push(format!(
                "Sessão: {} cookie(s) essenciais, estabelecida em {}",
                session.cookies.len(),
                session
                    .established_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string())
            )),
            None => lines.push("Sessão: nenhuma persistida".to_string()),
        }
        lines.push(format!(
            "Fila: {} pendente(s), {} processada(s)",
            self.pending, self.processed
        ));
        if !self.blacklisted.is_empty() {
            lines.push(format!("Proxies bloqueados: {}", self.blacklisted.join(", ")));
        }
        if !self.recent_runs.is_empty() {
            lines.push("Execuções recentes:".to_string());
            for run in &self.recent_runs {
                lines.push(format!(
                    "  - {} {} tentadas={} sucesso={} falhas={} ({})",
                    run.ts.as_deref().unwrap_or("-"),
                    run.run_id,
                    run.attempted,
                    run.succeeded,
                    run.failed,
                    run.stop_reason
                ));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ProxyCheckReport {
    pub loaded: usize,
    pub health: ProxyHealthReport,
    pub proxies: Vec<ProxyLine>,
}

#[derive(Debug, Serialize)]
pub struct ProxyLine {
    pub identity: String,
    pub score: f64,
    pub healthy: bool,
    pub blacklisted: bool,
}

impl DisplayFallback for ProxyCheckReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Proxies: {} carregados, {} verificados, {} saudáveis, {} falhas, {} bloqueados",
            self.loaded,
            self.health.checked,
            self.health.healthy,
            self.health.failed,
            self.health.blacklisted
        )];
        for proxy in &self.proxies {
            let status = if proxy.blacklisted {
                "bloqueado"
            } else if proxy.healthy {
                "ok"
            } else {
                "falha"
            };
            lines.push(format!(
                "  - {} score={:.2} [{}]",
                proxy.identity, proxy.score, status
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct QueueAddResult {
    pub id: String,
    pub pending: usize,
}

impl DisplayFallback for QueueAddResult {
    fn display(&self) -> String {
        format!("Ação {} adicionada ({} pendente(s))", self.id, self.pending)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueList {
    Pending { rows: Vec<PendingAction> },
    Processed { rows: Vec<ProcessedRecord> },
}

impl DisplayFallback for QueueList {
    fn display(&self) -> String {
        match self {
            QueueList::Pending { rows } if rows.is_empty() => "Fila vazia".to_string(),
            QueueList::Pending { rows } => rows
                .iter()
                .map(|action| format!("{} [{}] {}", action.id, action.category, action.target))
                .collect::<Vec<_>>()
                .join("\n"),
            QueueList::Processed { rows } if rows.is_empty() => {
                "Nenhuma ação processada".to_string()
            }
            QueueList::Processed { rows } => rows
                .iter()
                .map(|record| {
                    format!(
                        "{} [{}] {:?} {} via {} em {}",
                        record.action_id,
                        record.category,
                        record.status,
                        record.detail.as_deref().unwrap_or("-"),
                        record.proxy.as_deref().unwrap_or("direto"),
                        record.processed_at.to_rfc3339()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::controller::{AutomationTelemetry, RunContext};
    use std::fs;
    use tempfile::TempDir;

    const ALWAYS_OPEN: &str = r#"
[limits]
daily_limit = 2
weekly_limit = 10

[schedule]
operating_hours = [0, 0]

[session]
target_domain = "www.example.com"
essential_cookies = ["session_token"]

[orchestrator]
executor_program = "outreach-agent"

[observability]
enabled = true
"#;

    fn prepare_test_context(config: &str) -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("outreach.toml");
        fs::write(&config_path, config).unwrap();
        let cli = Cli {
            config: config_path,
            state_dir: Some(temp.path().join("state")),
            format: OutputFormat::Json,
            command: Commands::Status,
        };
        let context = AppContext::new(&cli).unwrap();
        (temp, context)
    }

    fn add_args(id: Option<&str>, target: &str) -> QueueAddArgs {
        QueueAddArgs {
            id: id.map(str::to_string),
            category: "connect".to_string(),
            target: target.to_string(),
            payload: None,
        }
    }

    #[test]
    fn fixture_config_loads() {
        let cli = Cli::try_parse_from([
            "outreachctl",
            "--config",
            "../configs/outreach.toml",
            "queue",
            "show",
        ])
        .unwrap();
        let context = AppContext::new(&cli).unwrap();
        assert_eq!(context.config.limits.daily_limit, 15);
        assert!(matches!(
            cli.command,
            Commands::Queue(QueueCommands::Show(QueueShowArgs { limit: 20, .. }))
        ));
    }

    #[tokio::test]
    async fn queue_add_rejects_duplicates_and_shows_entries() {
        let (_temp, context) = prepare_test_context(ALWAYS_OPEN);
        let added = context
            .queue_add(&add_args(Some("a-1"), "https://www.example.com/in/one"))
            .await
            .unwrap();
        assert_eq!(added.pending, 1);

        let duplicate = context
            .queue_add(&add_args(Some("a-1"), "https://www.example.com/in/two"))
            .await;
        assert!(matches!(duplicate, Err(AppError::InvalidInput(_))));

        let mut with_payload = add_args(None, "https://www.example.com/in/two");
        with_payload.payload = Some(r#"{"note":"hi"}"#.to_string());
        let generated = context.queue_add(&with_payload).await.unwrap();
        assert!(generated.id.starts_with("act-"));

        let list = context
            .queue_show(&QueueShowArgs {
                processed: false,
                limit: 10,
            })
            .await
            .unwrap();
        let QueueList::Pending { rows } = list else {
            panic!("expected pending rows");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].payload.as_ref().unwrap()["note"], "hi");
    }

    #[tokio::test]
    async fn preview_reports_quota_projection() {
        let (_temp, context) = prepare_test_context(ALWAYS_OPEN);
        for i in 1..=3 {
            context
                .queue_add(&add_args(Some(&format!("a-{i}")), "https://www.example.com/in/x"))
                .await
                .unwrap();
        }
        let preview = context.preview().await.unwrap();
        let decisions: Vec<_> = preview.rows.iter().map(|row| &row.decision).collect();
        assert_eq!(decisions[0], &PreviewDecision::Admit);
        assert_eq!(decisions[1], &PreviewDecision::Admit);
        assert!(matches!(decisions[2], PreviewDecision::Defer { .. }));
        assert!(preview.display().contains("adiada"));
    }

    #[tokio::test]
    async fn status_reads_state_and_recent_runs() {
        let (temp, context) = prepare_test_context(ALWAYS_OPEN);
        context
            .queue_add(&add_args(Some("a-1"), "https://www.example.com/in/one"))
            .await
            .unwrap();
        save_typed(
            context.store.as_ref(),
            PROXY_BLACKLIST_KEY,
            &["10.0.0.9:8080".to_string()][..],
        )
        .await
        .unwrap();

        let telemetry = AutomationTelemetry::new(
            temp.path().join("state/failures.jsonl"),
            temp.path().join("state/metrics.sqlite"),
        )
        .unwrap();
        telemetry
            .record_run(&RunContext {
                timestamp: Utc::now(),
                run_id: "run-1".into(),
                attempted: 2,
                succeeded: 2,
                failed: 0,
                skipped: 0,
                detections: 0,
                proxy_rotations: 1,
                stop_reason: "queue drained".into(),
                duration_ms: 1_500,
            })
            .unwrap();

        let status = context.gather_status().await.unwrap();
        assert_eq!(status.pending, 1);
        assert!(status.session.is_none());
        assert_eq!(status.blacklisted, vec!["10.0.0.9:8080".to_string()]);
        assert_eq!(status.recent_runs.len(), 1);
        assert_eq!(status.recent_runs[0].run_id, "run-1");

        let text = status.display();
        assert!(text.contains("1 pendente(s)"));
        assert!(text.contains("run-1"));
    }

    #[tokio::test]
    async fn queue_add_requires_category_and_target() {
        let (_temp, context) = prepare_test_context(ALWAYS_OPEN);
        let result = context.queue_add(&add_args(None, "  ")).await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }
}
