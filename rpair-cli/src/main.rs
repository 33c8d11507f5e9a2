//! # rpair CLI
//!
//! Pairs an LLM that writes R with an interpreter that runs it.
//!
//! Usage:
//!   rpair [analyst]             autonomous run on the fixed analyst task
//!   rpair feedback              human-in-the-loop run in a persistent R session
//!   rpair exec <file|->         run one R file and print the result
//!   rpair extract               print the first R block found on stdin
//!
//! Examples:
//!   OPENAI_API_KEY=sk-... rpair --max-turns 5
//!   rpair --task "Plot mpg against wt from mtcars" --stream
//!   rpair exec --backend session analysis.R
//!   pbpaste | rpair extract > snippet.R

mod logging;

use clap::{Parser, Subcommand, ValueEnum};
use rpair_agent::{AgentConfig, HumanInput, LoopOutcome, StdinInput, TurnLoop};
use rpair_core::{
    extract_r_code, AnyRunner, CodeRunner, Error, ErrorKind, Extraction, LlmProvider, Message,
    OpenAIProvider, ProviderConfig, RSession, Result, Role, RscriptConfig, RscriptRunner,
    RunnerKind, SessionConfig,
};
use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "rpair")]
#[command(author, version, about = "rpair - an LLM writes R, an interpreter runs it")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Model to ask (overrides RPAIR_MODEL)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Replace the built-in task
    #[arg(short, long, global = true)]
    task: Option<String>,

    /// Print the coder's reply as it is generated
    #[arg(long, global = true)]
    stream: bool,

    /// Quiet mode - only show the final coder message
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print the finished run as JSON instead of the conversation
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging for rpair when RUST_LOG is unset
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Interpreter used by the subprocess backend
    #[arg(long, global = true, default_value = "Rscript")]
    rscript: String,

    /// Extra argument for the subprocess interpreter, placed before the
    /// script path (repeatable)
    #[arg(long = "rscript-arg", global = true, allow_hyphen_values = true)]
    rscript_args: Vec<String>,

    /// Interpreter used by the session backend
    #[arg(long, global = true, default_value = "R")]
    r_binary: String,

    /// Text that tells the loop the coder is finished
    #[arg(long, global = true)]
    completion_token: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Autonomous run: the coder iterates until it says the token (default)
    Analyst {
        /// Maximum number of coder turns
        #[arg(long, default_value = "10")]
        max_turns: usize,
    },
    /// A human reviews every result; an empty line ends the run
    Feedback {
        /// Stop after this many coder turns
        #[arg(long)]
        max_turns: Option<usize>,
    },
    /// Run an R file (or - for stdin) and print the result
    Exec {
        #[arg(required = true)]
        file: String,

        #[arg(short, long, value_enum, default_value_t = Backend::Rscript)]
        backend: Backend,
    },
    /// Print the first R block of the text on stdin
    Extract,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    /// Fresh Rscript process per run
    Rscript,
    /// Persistent R session
    Session,
}

impl From<Backend> for RunnerKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Rscript => RunnerKind::Rscript,
            Backend::Session => RunnerKind::Session,
        }
    }
}

/// How the conversation is shown
#[derive(Debug, Clone, Copy)]
struct Output {
    quiet: bool,
    json: bool,
    stream: bool,
}

impl Output {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            quiet: cli.quiet,
            json: cli.json,
            stream: cli.stream && !cli.quiet && !cli.json,
        }
    }

    fn live(&self) -> bool {
        !self.quiet && !self.json
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) if e.kind().is_startup() => {
            eprintln!("Startup failed: {}", e);
            eprintln!("{}", startup_hint(&e));
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let command = cli
        .command
        .clone()
        .unwrap_or(Commands::Analyst { max_turns: 10 });

    match command {
        Commands::Analyst { max_turns } => analyst(&cli, max_turns).await,
        Commands::Feedback { max_turns } => feedback(&cli, max_turns).await,
        Commands::Exec { file, backend } => exec(&cli, &file, backend.into()).await,
        Commands::Extract => extract().await,
    }
}

/// What to do about a missing credential or interpreter.
fn startup_hint(err: &Error) -> &'static str {
    match err.kind() {
        ErrorKind::CredentialMissing => "Set OPENAI_API_KEY (and optionally OPENAI_BASE_URL, RPAIR_MODEL).",
        ErrorKind::InterpreterNotFound => "Install R or point --rscript / --r-binary at the interpreter.",
        _ => "",
    }
}

fn rscript_config(cli: &Cli) -> RscriptConfig {
    RscriptConfig::default()
        .with_program(&cli.rscript)
        .with_args(cli.rscript_args.clone())
}

fn provider(cli: &Cli) -> Result<OpenAIProvider> {
    let mut config = ProviderConfig::from_env()?;
    if let Some(model) = &cli.model {
        config = config.with_model(model.clone());
    }
    OpenAIProvider::new(config)
}

fn agent_config(cli: &Cli, base: AgentConfig) -> AgentConfig {
    let mut config = base;
    if let Some(task) = &cli.task {
        config = config.with_task(task.clone());
    }
    if let Some(token) = &cli.completion_token {
        config = config.with_completion_token(token.clone());
    }
    if let Some(model) = &cli.model {
        config = config.with_model(model.clone());
    }
    config
}

async fn analyst(cli: &Cli, max_turns: usize) -> Result<i32> {
    let provider = provider(cli)?;
    let runner = RscriptRunner::new(rscript_config(cli));
    let version = runner.probe().await?;
    debug!(version = %version, "interpreter found");

    let config = agent_config(cli, AgentConfig::analyst()).with_max_turns(Some(max_turns));
    let turn_loop = TurnLoop::autonomous(config, provider, runner)?;
    let (outcome, _runner) = drive(turn_loop, Output::from_cli(cli)).await?;
    report(&outcome, Output::from_cli(cli))?;
    Ok(0)
}

async fn feedback(cli: &Cli, max_turns: Option<usize>) -> Result<i32> {
    let provider = provider(cli)?;
    let session = RSession::start_with(SessionConfig::default().with_program(&cli.r_binary)).await?;

    let config = agent_config(cli, AgentConfig::feedback()).with_max_turns(max_turns);
    let turn_loop = TurnLoop::human_in_the_loop(config, provider, session, StdinInput::new())?;
    let (outcome, session) = drive(turn_loop, Output::from_cli(cli)).await?;
    if let Err(e) = session.close().await {
        warn!(error = %e, "R session did not shut down cleanly");
    }
    report(&outcome, Output::from_cli(cli))?;
    Ok(0)
}

/// Attach the console to the loop, run it, and hand the runner back.
async fn drive<P, R, H>(turn_loop: TurnLoop<P, R, H>, output: Output) -> Result<(LoopOutcome, R)>
where
    P: LlmProvider,
    R: CodeRunner,
    H: HumanInput,
{
    let mut turn_loop = turn_loop;
    if output.live() {
        // true until the first delta of the current coder reply
        let fresh = Rc::new(Cell::new(true));

        if output.stream {
            let fresh = Rc::clone(&fresh);
            turn_loop = turn_loop.with_streaming(move |delta| {
                if fresh.replace(false) {
                    println!("---------- {} ----------", Role::Coder);
                }
                print!("{}", delta);
                let _ = std::io::stdout().flush();
            });
        }

        turn_loop = turn_loop.with_observer(move |message: &Message| {
            if output.stream && message.role == Role::Coder && !fresh.replace(true) {
                println!("\n");
                return;
            }
            println!("{}\n", message.render());
        });
    }

    let outcome = turn_loop.run().await?;
    Ok((outcome, turn_loop.into_runner()))
}

fn report(outcome: &LoopOutcome, output: Output) -> Result<()> {
    if output.json {
        let json = serde_json::to_string_pretty(outcome)
            .map_err(|e| Error::unexpected("failed to serialize outcome").set_source(e))?;
        println!("{}", json);
        return Ok(());
    }

    if output.quiet {
        if let Some(last) = outcome.transcript.last_from(Role::Coder) {
            println!("{}", last.text);
        }
        return Ok(());
    }

    println!(
        "=== {} after {} turn(s), {} execution(s) ===",
        outcome.stop_reason, outcome.turns.turn_count, outcome.executions
    );
    Ok(())
}

async fn exec(cli: &Cli, file: &str, kind: RunnerKind) -> Result<i32> {
    let code = if file == "-" {
        read_stdin().await?
    } else {
        tokio::fs::read_to_string(file)
            .await
            .map_err(|e| Error::from(e).with_operation("exec::read").with_context("path", file))?
    };

    let mut runner = match kind {
        RunnerKind::Rscript => {
            AnyRunner::Rscript(RscriptRunner::new(rscript_config(cli)))
        }
        RunnerKind::Session => AnyRunner::Session(
            RSession::start_with(SessionConfig::default().with_program(&cli.r_binary)).await?,
        ),
    };
    debug!(backend = runner.name(), bytes = code.len(), "executing file");

    let result = runner.run(&code).await;
    if let AnyRunner::Session(session) = runner {
        if let Err(e) = session.close().await {
            warn!(error = %e, "R session did not shut down cleanly");
        }
    }

    if cli.json {
        let json = serde_json::to_string_pretty(&result)
            .map_err(|e| Error::unexpected("failed to serialize result").set_source(e))?;
        println!("{}", json);
    } else {
        println!("{}", result.report());
    }
    Ok(if result.succeeded { 0 } else { 1 })
}

async fn extract() -> Result<i32> {
    let text = read_stdin().await?;
    match extract_r_code(&text) {
        Extraction::Found { code } => {
            println!("{}", code);
            Ok(0)
        }
        Extraction::NotFound => {
            eprintln!("No R code block found");
            Ok(1)
        }
    }
}

async fn read_stdin() -> Result<String> {
    let mut text = String::new();
    tokio::io::stdin()
        .read_to_string(&mut text)
        .await
        .map_err(|e| Error::from(e).with_operation("stdin::read"))?;
    Ok(text)
}
