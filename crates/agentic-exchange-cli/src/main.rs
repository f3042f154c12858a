//! AgenticExchange CLI — `axc` command.
//!
//! Drives connection, credential and proof exchanges against an agent admin
//! API, and runs a self-contained demo flow against an in-memory agent pair.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use agentic_exchange::time::micros_to_rfc3339;
use agentic_exchange::{
    AgentService, ConnectionExchange, CredentialExchange, ExchangeConfig, ExchangeId, ExchangeKind,
    ExchangeRecord, ExchangeState, FlowCoordinator, FlowSide, FlowVariant, HttpAgentService,
    InMemoryAgent, InvitationArtifact, Poller, PresentationExchange, PresentationResult,
    ProofConstraint, SchemaDefinition, Verified,
};

/// Poll interval used by `demo` unless `--interval` is given.
const DEMO_INTERVAL_MS: u64 = 50;

// ── CLI structure ─────────────────────────────────────────────────────────────

/// AgenticExchange CLI — connect agents, issue credentials, request and
/// present proofs.
#[derive(Parser, Debug)]
#[command(
    name = "axc",
    about = "AgenticExchange CLI",
    version,
    long_about = "axc — AgenticExchange CLI\n\nDrive connection, credential and proof exchanges against an agent,\nor run the full flow against an in-memory agent pair with `axc demo`."
)]
struct Cli {
    /// Agent admin API base URL (overrides config and AXC_AGENT_URL)
    #[arg(long, global = true)]
    agent_url: Option<String>,

    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Poll and discovery interval in milliseconds
    #[arg(long, global = true)]
    interval: Option<u64>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a connection invitation
    Invite {
        /// Alias for the new connection
        #[arg(long)]
        alias: String,

        /// Poll until the connection is ready
        #[arg(long)]
        wait: bool,
    },

    /// Accept a connection invitation
    Accept {
        /// Invitation URL, base64 payload or JSON
        invitation: String,

        /// Alias for the new connection
        #[arg(long)]
        alias: String,

        /// Poll until the connection is active
        #[arg(long)]
        wait: bool,
    },

    /// Query the current state of an exchange once
    Status {
        /// Exchange kind
        #[arg(value_enum)]
        kind: KindArg,

        /// Connection or exchange id
        id: String,
    },

    /// Publish a schema and a credential definition over it
    Publish {
        /// Schema name
        #[arg(long)]
        name: String,

        /// Schema version
        #[arg(long, default_value = "1.0")]
        schema_version: String,

        /// Attribute names (repeatable)
        #[arg(long = "attr", required = true)]
        attributes: Vec<String>,
    },

    /// Offer a credential on a connection
    Issue {
        /// Connection id
        #[arg(long)]
        connection: String,

        /// Credential definition id
        #[arg(long)]
        definition: String,

        /// Attribute values as name=value (repeatable)
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,

        /// Poll until the credential is issued
        #[arg(long)]
        wait: bool,
    },

    /// Find and accept the credential offer pending on a connection
    Receive {
        /// Connection id
        #[arg(long)]
        connection: String,

        /// Poll until the credential is received
        #[arg(long)]
        wait: bool,
    },

    /// Request a proof on a connection
    RequestProof {
        /// Connection id
        #[arg(long)]
        connection: String,

        /// Proof constraint as JSON
        #[arg(long)]
        constraint: String,

        /// Poll until the presentation is verified
        #[arg(long)]
        wait: bool,
    },

    /// Find the proof request pending on a connection and answer it
    Present {
        /// Connection id
        #[arg(long)]
        connection: String,

        /// Credential id to present
        #[arg(long)]
        credential: String,

        /// Poll until the presentation is sent
        #[arg(long)]
        wait: bool,
    },

    /// Run a full issue-and-present flow against an in-memory agent pair
    Demo,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Connection,
    Credential,
    Presentation,
}

impl From<KindArg> for ExchangeKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Connection => ExchangeKind::Connection,
            KindArg::Credential => ExchangeKind::Credential,
            KindArg::Presentation => ExchangeKind::Presentation,
        }
    }
}

fn parse_attribute(s: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    if name.trim().is_empty() {
        return Err(format!("attribute name is empty in '{s}'"));
    }
    Ok((name.trim().to_string(), value.to_string()))
}

// ── Main entry point ──────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Demo => {
            let demo_config = ExchangeConfig {
                poll_interval_ms: cli.interval.unwrap_or(DEMO_INTERVAL_MS),
                discovery_interval_ms: cli.interval.unwrap_or(DEMO_INTERVAL_MS),
                ..config
            };
            cmd_demo(demo_config).await
        }
        Commands::Invite { alias, wait } => cmd_invite(&config, &alias, wait).await,
        Commands::Accept {
            invitation,
            alias,
            wait,
        } => cmd_accept(&config, &alias, &invitation, wait).await,
        Commands::Status { kind, id } => cmd_status(&config, kind.into(), &id).await,
        Commands::Publish {
            name,
            schema_version,
            attributes,
        } => cmd_publish(&config, name, schema_version, attributes).await,
        Commands::Issue {
            connection,
            definition,
            attributes,
            wait,
        } => {
            let attributes = attributes.into_iter().collect();
            cmd_issue(&config, &connection, &definition, attributes, wait).await
        }
        Commands::Receive { connection, wait } => cmd_receive(&config, &connection, wait).await,
        Commands::RequestProof {
            connection,
            constraint,
            wait,
        } => cmd_request_proof(&config, &connection, &constraint, wait).await,
        Commands::Present {
            connection,
            credential,
            wait,
        } => cmd_present(&config, &connection, &credential, wait).await,
    }
}

// ── Configuration helpers ─────────────────────────────────────────────────────

/// Defaults, then the config file, then `AXC_*`, then flags.
fn resolve_config(cli: &Cli) -> Result<ExchangeConfig> {
    let base = match &cli.config {
        Some(path) => ExchangeConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ExchangeConfig::default(),
    };
    let mut config = base
        .with_env_overrides()
        .context("invalid AXC_* environment")?;
    if let Some(url) = &cli.agent_url {
        config.agent_url = Some(url.clone());
    }
    if let Some(ms) = cli.interval {
        config.poll_interval_ms = ms;
        config.discovery_interval_ms = ms;
    }
    config.validate()?;
    Ok(config)
}

fn http_agent(config: &ExchangeConfig) -> Result<Arc<dyn AgentService>> {
    let url = config
        .agent_url
        .as_deref()
        .ok_or_else(|| anyhow!("no agent URL: pass --agent-url or set AXC_AGENT_URL"))?;
    let agent = HttpAgentService::new(url, config.request_timeout())?;
    Ok(Arc::new(agent))
}

fn print_record(label: &str, record: &ExchangeRecord) {
    println!(
        "{label}: {} {} is {} (polled {} times, since {})",
        record.kind,
        record.id_str(),
        record.state(),
        record.poll_count,
        micros_to_rfc3339(record.created_at)
    );
}

/// A demo run only succeeds if the verifier accepted the proof.
fn require_verified(result: &PresentationResult) -> Result<()> {
    match result.verified {
        Verified::True => Ok(()),
        other => Err(anyhow!("presentation was not verified (verified={other})")),
    }
}

fn print_result(result: &PresentationResult) {
    println!("  Verified: {}", result.verified);
    for (name, value) in &result.revealed_attributes {
        println!("  {name} = {value}");
    }
}

// ── Command implementations ───────────────────────────────────────────────────

/// `axc invite --alias ALIAS [--wait]`
async fn cmd_invite(config: &ExchangeConfig, alias: &str, wait: bool) -> Result<()> {
    let mut connection = ConnectionExchange::new(http_agent(config)?, Poller::new(), config);
    let created = connection.create_invitation(alias).await?;
    println!("Connection: {}", created.id);
    println!("Invitation: {}", created.invitation);

    if wait {
        let watch = connection.await_active(&created.id)?;
        print_record("Ready", &watch.ready().await?);
    }
    Ok(())
}

/// `axc accept INVITATION --alias ALIAS [--wait]`
async fn cmd_accept(
    config: &ExchangeConfig,
    alias: &str,
    invitation: &str,
    wait: bool,
) -> Result<()> {
    let mut connection = ConnectionExchange::new(http_agent(config)?, Poller::new(), config);
    let accepted = connection
        .accept_invitation(alias, &InvitationArtifact::new(invitation))
        .await?;
    println!("Connection: {}", accepted.id);
    if let Some(label) = &accepted.their_label {
        println!("Inviter:    {label}");
    }

    if wait {
        let watch = connection.await_active(&accepted.id)?;
        print_record("Ready", &watch.ready().await?);
    }
    Ok(())
}

/// `axc status {connection|credential|presentation} ID`
async fn cmd_status(config: &ExchangeConfig, kind: ExchangeKind, id: &str) -> Result<()> {
    let agent = http_agent(config)?;
    let id = ExchangeId::from(id);
    let raw = match kind {
        ExchangeKind::Connection => agent.connection_state(&id).await?.state,
        ExchangeKind::Credential => agent.credential_exchange_state(&id).await?.state,
        ExchangeKind::Presentation => agent.presentation_exchange_state(&id).await?.state,
    };
    let state = ExchangeState::parse(kind, &raw)?;
    let terminal = if agentic_exchange::state::is_terminal(&state) {
        " (terminal)"
    } else {
        ""
    };
    println!("{kind} {id}: {state}{terminal}");
    Ok(())
}

/// `axc publish --name NAME --attr A --attr B`
async fn cmd_publish(
    config: &ExchangeConfig,
    name: String,
    version: String,
    attributes: Vec<String>,
) -> Result<()> {
    let credential = CredentialExchange::new(http_agent(config)?, Poller::new(), config);
    let schema = SchemaDefinition {
        name,
        version,
        attributes,
    };
    let published = credential.publish_definition(&schema).await?;
    println!("Schema:     {}", published.schema_id);
    println!("Definition: {}", published.definition_id);
    Ok(())
}

/// `axc issue --connection ID --definition DEF --attr name=value [--wait]`
async fn cmd_issue(
    config: &ExchangeConfig,
    connection: &str,
    definition: &str,
    attributes: BTreeMap<String, String>,
    wait: bool,
) -> Result<()> {
    let mut credential = CredentialExchange::new(http_agent(config)?, Poller::new(), config);
    let sent = credential
        .send_offer(&ExchangeId::from(connection), definition, attributes)
        .await?;
    println!("Offer: {}", sent.exchange_id);

    if wait {
        let watch = credential.await_issuance(&sent.exchange_id)?;
        print_record("Issued", &watch.ready().await?);
        if let Some(last) = watch.finished().await.completed() {
            print_record("Final", &last);
        }
    }
    Ok(())
}

/// `axc receive --connection ID [--wait]`
async fn cmd_receive(config: &ExchangeConfig, connection: &str, wait: bool) -> Result<()> {
    let mut credential = CredentialExchange::new(http_agent(config)?, Poller::new(), config);
    let offer = credential
        .discover_offer(&ExchangeId::from(connection))
        .await?
        .ok_or_else(|| anyhow!("no credential offer pending on {connection}"))?;
    println!("Offer: {}", offer.exchange_id);
    for (name, value) in &offer.attributes {
        println!("  {name} = {value}");
    }

    let accepted = credential.accept_offer(&offer.exchange_id).await?;
    println!("Holder identifier: {}", accepted.holder_identifier);

    if wait {
        let watch = credential.await_issuance(&offer.exchange_id)?;
        let received = watch.ready().await?;
        print_record("Received", &received);
        if let Some(id) = received.credential().and_then(|c| c.credential_id.as_deref()) {
            println!("Credential: {id}");
        }
    }
    Ok(())
}

/// `axc request-proof --connection ID --constraint JSON [--wait]`
async fn cmd_request_proof(
    config: &ExchangeConfig,
    connection: &str,
    constraint: &str,
    wait: bool,
) -> Result<()> {
    let constraint: serde_json::Value =
        serde_json::from_str(constraint).context("constraint is not valid JSON")?;
    let mut presentation = PresentationExchange::new(http_agent(config)?, Poller::new(), config);
    let sent = presentation
        .send_request(&ExchangeId::from(connection), ProofConstraint(constraint))
        .await?;
    println!("Proof request: {}", sent.exchange_id);

    if wait {
        let watch = presentation.await_verification(&sent.exchange_id)?;
        watch.ready().await?;
        let last = watch
            .finished()
            .await
            .completed()
            .ok_or_else(|| anyhow!("verification poll was cancelled"))?;
        print_result(&PresentationResult::from_record(&last)?);
    }
    Ok(())
}

/// `axc present --connection ID --credential CRED [--wait]`
async fn cmd_present(
    config: &ExchangeConfig,
    connection: &str,
    credential: &str,
    wait: bool,
) -> Result<()> {
    let mut presentation = PresentationExchange::new(http_agent(config)?, Poller::new(), config);
    let request = presentation
        .discover_request(&ExchangeId::from(connection))
        .await?
        .ok_or_else(|| anyhow!("no proof request pending on {connection}"))?;
    let submitted = presentation
        .submit_presentation(&request.exchange_id, credential)
        .await?;
    println!("Presentation: {} ({})", request.exchange_id, submitted.state);

    if wait {
        let watch = presentation.await_verification(&request.exchange_id)?;
        print_record("Sent", &watch.ready().await?);
    }
    Ok(())
}

/// `axc demo`
async fn cmd_demo(config: ExchangeConfig) -> Result<()> {
    let (issuer_agent, holder_agent) = InMemoryAgent::pair();
    let variant = FlowVariant::IssueAndPresent;
    let mut issuer = FlowCoordinator::new(
        FlowSide::Issuer,
        variant,
        issuer_agent.clone(),
        config.clone(),
    );
    let mut holder = FlowCoordinator::new(FlowSide::Holder, variant, holder_agent, config.clone());

    let setup = CredentialExchange::new(issuer_agent, Poller::new(), &config);
    let published = setup
        .publish_definition(&SchemaDefinition {
            name: "employee".into(),
            version: "1.0".into(),
            attributes: vec!["name".into(), "expiry".into()],
        })
        .await?;
    println!("[setup]  definition {}", published.definition_id);

    // Connection
    let created = issuer.create_invitation("Org-A").await?;
    println!("[issuer] invitation for connection {}", created.id);
    let accepted = holder
        .accept_invitation("Org-B", &created.invitation)
        .await?;
    println!("[holder] accepted invitation, connection {}", accepted.id);
    let (a, b) = tokio::try_join!(issuer.connection_ready(), holder.connection_ready())?;
    println!("[issuer] connection ready ({})", a.state());
    println!("[holder] connection ready ({})", b.state());

    // Credential
    let attributes = BTreeMap::from([
        ("name".to_string(), "Alice".to_string()),
        ("expiry".to_string(), "2030".to_string()),
    ]);
    let sent = issuer
        .offer_credential(&published.definition_id, attributes)
        .await?;
    println!("[issuer] offered credential {}", sent.exchange_id);
    let offer = holder.wait_for_offer().await?;
    let taken = holder.accept_credential(&offer.exchange_id).await?;
    println!(
        "[holder] accepted offer {} as {}",
        offer.exchange_id, taken.holder_identifier
    );
    let (issued, received) =
        tokio::try_join!(issuer.credential_ready(), holder.credential_ready())?;
    println!("[issuer] credential {}", issued.state());
    println!("[holder] credential {}", received.state());

    // Presentation
    let constraint = ProofConstraint(serde_json::json!({
        "requested_attributes": {
            "name": { "restrictions": [{ "cred_def_id": published.definition_id }] }
        }
    }));
    let request = issuer.request_presentation(constraint).await?;
    println!("[issuer] requested proof {}", request.exchange_id);
    let found = holder.wait_for_request().await?;
    let submitted = holder.present_credential(&found.exchange_id).await?;
    println!("[holder] presentation {}", submitted.state);
    let result = issuer.presentation_result().await?;
    println!("[issuer] presentation verified={}", result.verified);
    print_result(&result);
    require_verified(&result)?;

    issuer.teardown();
    holder.teardown();
    println!("Flow complete.");
    Ok(())
}
