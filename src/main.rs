//! fwmgr - per-user firewall policy manager
//!
//! Command-line front-end: edits the policy store, compiles it and loads the
//! result into the kernel with one atomic `iptables-restore` batch.
//!
//! # Usage
//!
//! ```bash
//! fwmgr init --host 10.0.0.1 --subnet 10.0.0.0/24
//! fwmgr user add alice                       # ROUTE user, first free address
//! fwmgr user add bob --mode nat --email bob@example.com
//! fwmgr rule add alice 1.1.1.1 --port 80     # tcp/ACCEPT by default
//! fwmgr rule add alice 10.20.0.0/16 --protocol all --action drop
//! fwmgr validate                             # dry-run preview
//! fwmgr validate --format batch --check      # batch text, parse-checked by iptables-restore --test
//! fwmgr apply                                # atomic load
//! fwmgr verify                               # compare the live ruleset with the policy
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use fwmgr::audit::{self, AuditLog, EventType};
use fwmgr::config::{self, AppConfig};
use fwmgr::core::applier::ApplyLock;
use fwmgr::core::batch::{batch_checksum, render_batch};
use fwmgr::core::error::IptablesErrorPattern;
use fwmgr::core::model::{RuleId, UserKind};
use fwmgr::core::store::{JsonStore, NewRule, NewUser, PolicyStore, RuleFilter, UserUpdate};
use fwmgr::core::verify::compare_live;
use fwmgr::utils::{find_binary, get_state_dir, truncate_string};
use fwmgr::validators::check_well_known_port;
use fwmgr::{
    compile, Action, Destination, DirectiveSet, Error, ForwardMode, NetworkConfig,
    PolicyApplier, Protocol, Result,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::warn;

shadow_rs::shadow!(build);

/// Exit status of `verify` when the live ruleset has drifted
const EXIT_DRIFT: u8 = 2;

#[derive(Parser)]
#[command(name = "fwmgr")]
#[command(about = "Per-user firewall policy manager for iptables", long_about = None)]
#[command(version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Config file (default: ~/.config/fwmgr/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Policy store (default: ~/.local/share/fwmgr/policy.json)
    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the host address and the user subnet
    Init {
        /// Address of this host on the user subnet
        #[arg(long)]
        host: String,
        /// User subnet in CIDR notation (e.g. 10.0.0.0/24)
        #[arg(long)]
        subnet: String,
    },
    /// Show the network, record counts, tool availability and recent activity
    Status,
    /// Manage users
    #[command(subcommand)]
    User(UserCommand),
    /// Manage access rules
    #[command(subcommand)]
    Rule(RuleCommand),
    /// Compile the policy without loading it
    Validate {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Also parse-check the batch with `iptables-restore --test`
        #[arg(long)]
        check: bool,
    },
    /// Compile the policy and load it into the kernel atomically
    Apply {
        /// Override the enforcement tool timeout
        #[arg(long, value_name = "SECONDS")]
        timeout: Option<u64>,
    },
    /// Compare the live ruleset with the compiled policy
    Verify,
}

#[derive(Subcommand)]
enum UserCommand {
    /// Register a user and assign an address
    Add {
        name: String,
        /// Address inside the user subnet (default: first free one)
        #[arg(long)]
        address: Option<Ipv4Addr>,
        /// Forwarding mode: route or nat
        #[arg(long, default_value = "route")]
        mode: ForwardMode,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        contact: Option<String>,
        /// employee, vendor or other
        #[arg(long, default_value = "employee")]
        kind: UserKind,
    },
    /// Change a user's address, forwarding mode or metadata
    Edit {
        name: String,
        #[arg(long)]
        address: Option<Ipv4Addr>,
        #[arg(long)]
        mode: Option<ForwardMode>,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        contact: Option<String>,
        #[arg(long)]
        kind: Option<UserKind>,
    },
    /// Remove a user together with its rules
    Remove { name: String },
    /// List users
    List,
    /// Print the address the next user would get
    NextIp,
}

#[derive(Subcommand)]
enum RuleCommand {
    /// Add an access rule to a user
    Add {
        user: String,
        /// IPv4 address, CIDR network or hostname
        destination: Destination,
        #[arg(long)]
        port: Option<u16>,
        /// tcp, udp or all
        #[arg(long, default_value = "tcp")]
        protocol: Protocol,
        /// accept or drop
        #[arg(long, default_value = "accept")]
        action: Action,
    },
    /// Remove a rule by id
    Remove { id: u64 },
    /// List rules
    List {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        protocol: Option<Protocol>,
        #[arg(long)]
        action: Option<Action>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Annotated preview grouped by chain
    Text,
    /// The exact iptables-restore input
    Batch,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = fwmgr::utils::ensure_dirs() {
        warn!("Failed to create fwmgr directories: {e}");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn report_error(e: &Error) {
    eprintln!("Error: {e}");
    if let Some(diagnostic) = e.tool_diagnostic() {
        if !diagnostic.is_empty() {
            eprintln!("\n{diagnostic}");
        }
        let translation = IptablesErrorPattern::match_error(diagnostic);
        eprintln!("\n{}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    }
}

/// Resolved configuration, store and audit log for one invocation
struct Context {
    config: AppConfig,
    store: JsonStore,
    audit: AuditLog,
}

impl Context {
    async fn load(config_path: Option<PathBuf>, database: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.or_else(config::config_path).ok_or_else(|| {
            Error::Configuration("cannot determine the config directory; pass --config".into())
        })?;
        let mut config = config::load_config(&config_path).await?;
        config.apply_env_overrides();

        let database = match database.or_else(|| config.database_path.clone()) {
            Some(path) => path,
            None => JsonStore::default_path()?,
        };

        let audit = if config.audit_enabled {
            AuditLog::new().unwrap_or_else(|e| {
                warn!("Audit log unavailable: {e}");
                AuditLog::disabled()
            })
        } else {
            AuditLog::disabled()
        };

        Ok(Self {
            config,
            store: JsonStore::new(database),
            audit,
        })
    }

    fn applier(&self) -> PolicyApplier {
        PolicyApplier::new(self.config.applier.clone())
    }

    /// Compiles the stored policy as it is on disk right now.
    async fn compile_current(&self) -> Result<DirectiveSet> {
        let db = self.store.load().await?;
        compile(&db.snapshot()?, &self.config.input)
    }
}

async fn handle_cli(cli: Cli) -> Result<ExitCode> {
    let ctx = Context::load(cli.config, cli.database).await?;

    match cli.command {
        Commands::Init { host, subnet } => init(&ctx, &host, &subnet).await?,
        Commands::Status => status(&ctx).await?,
        Commands::User(command) => user_command(&ctx, command).await?,
        Commands::Rule(command) => rule_command(&ctx, command).await?,
        Commands::Validate { format, check } => return validate(&ctx, format, check).await,
        Commands::Apply { timeout } => apply(&ctx, timeout).await?,
        Commands::Verify => return verify(&ctx).await,
    }
    Ok(ExitCode::SUCCESS)
}

async fn init(ctx: &Context, host: &str, subnet: &str) -> Result<()> {
    let network = NetworkConfig::parse(host, subnet)?;
    let mut db = ctx.store.load().await?;
    db.initialize(network.clone())?;
    ctx.store.save(&db).await?;

    audit::log_change(
        &ctx.audit,
        EventType::Initialize,
        serde_json::json!({
            "host_address": network.host_address().to_string(),
            "subnet": network.subnet().to_string(),
        }),
    )
    .await;

    println!(
        "✓ Network configured: host {} on {}",
        network.host_address(),
        network.subnet()
    );
    println!("Policy store: {}", ctx.store.path().display());
    Ok(())
}

async fn status(ctx: &Context) -> Result<()> {
    let db = ctx.store.load().await?;
    println!("Policy store: {}", ctx.store.path().display());

    match db.network() {
        Some(network) => {
            let users = db.users();
            let nat = users.iter().filter(|u| u.mode == ForwardMode::Nat).count();
            println!("Host address: {}", network.host_address());
            println!("User subnet:  {}", network.subnet());
            println!(
                "Users: {} ({} ROUTE, {} NAT)",
                users.len(),
                users.len() - nat,
                nat
            );
            println!("Rules: {}", db.rule_count());
            match db.next_address() {
                Ok(address) => println!("Next address: {address}"),
                Err(e) => println!("Next address: none ({e})"),
            }
        }
        None => println!("Network: not configured (run `fwmgr init`)"),
    }

    let settings = &ctx.config.applier;
    for tool in [&settings.restore_command, &settings.save_command] {
        match find_binary(tool) {
            Some(path) => println!("{tool}: {}", path.display()),
            None => println!("{tool}: not found"),
        }
    }
    if settings.elevate && !nix::unistd::getuid().is_root() {
        println!("Note: Not running as root. Will use sudo/run0/pkexec for apply.");
    }

    let recent = ctx.audit.read_recent(5).await.unwrap_or_default();
    if !recent.is_empty() {
        println!("\nRecent activity:");
        for event in recent {
            println!(
                "  {}  {:?} ({})",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.event_type,
                if event.success { "ok" } else { "failed" }
            );
        }
    }
    Ok(())
}

async fn user_command(ctx: &Context, command: UserCommand) -> Result<()> {
    match command {
        UserCommand::Add {
            name,
            address,
            mode,
            full_name,
            email,
            contact,
            kind,
        } => {
            let mut db = ctx.store.load().await?;
            let user = db.add_user(NewUser {
                name,
                address,
                mode,
                full_name,
                email,
                contact,
                kind,
            })?;
            ctx.store.save(&db).await?;
            audit::log_change(
                &ctx.audit,
                EventType::AddUser,
                serde_json::json!({
                    "user": user.name,
                    "address": user.address.to_string(),
                    "mode": user.mode.as_ref(),
                }),
            )
            .await;
            println!(
                "✓ Added user '{}' (#{}) at {} ({})",
                user.name, user.id, user.address, user.mode
            );
        }
        UserCommand::Edit {
            name,
            address,
            mode,
            full_name,
            email,
            contact,
            kind,
        } => {
            let mut db = ctx.store.load().await?;
            let user = db.update_user(
                &name,
                UserUpdate {
                    address,
                    mode,
                    full_name,
                    email,
                    contact,
                    kind,
                },
            )?;
            ctx.store.save(&db).await?;
            audit::log_change(
                &ctx.audit,
                EventType::EditUser,
                serde_json::json!({
                    "user": user.name,
                    "address": user.address.to_string(),
                    "mode": user.mode.as_ref(),
                }),
            )
            .await;
            println!(
                "✓ Updated user '{}': {} ({})",
                user.name, user.address, user.mode
            );
        }
        UserCommand::Remove { name } => {
            let mut db = ctx.store.load().await?;
            let (user, removed) = db.delete_user(&name)?;
            ctx.store.save(&db).await?;
            audit::log_change(
                &ctx.audit,
                EventType::RemoveUser,
                serde_json::json!({
                    "user": user.name,
                    "rules_removed": removed,
                }),
            )
            .await;
            println!("✓ Removed user '{}' and {removed} rule(s)", user.name);
        }
        UserCommand::List => {
            let db = ctx.store.load().await?;
            let users = db.users();
            if users.is_empty() {
                println!("No users.");
                return Ok(());
            }
            println!(
                "{:>4}  {:<16} {:<15} {:<5} {:>5}  {:<8} NAME",
                "ID", "USER", "ADDRESS", "MODE", "RULES", "KIND"
            );
            for user in users {
                println!(
                    "{:>4}  {:<16} {:<15} {:<5} {:>5}  {:<8} {}",
                    user.id.0,
                    user.name,
                    user.address.to_string(),
                    user.mode.as_ref(),
                    db.rules_of(user.id).len(),
                    user.kind.to_string(),
                    truncate_string(user.full_name.as_deref().unwrap_or("-"), 32)
                );
            }
        }
        UserCommand::NextIp => {
            let db = ctx.store.load().await?;
            println!("{}", db.next_address()?);
        }
    }
    Ok(())
}

async fn rule_command(ctx: &Context, command: RuleCommand) -> Result<()> {
    match command {
        RuleCommand::Add {
            user,
            destination,
            port,
            protocol,
            action,
        } => {
            let mut db = ctx.store.load().await?;
            let rule = db.add_rule(NewRule {
                user: user.clone(),
                destination,
                port,
                protocol,
                action,
            })?;
            ctx.store.save(&db).await?;
            audit::log_change(
                &ctx.audit,
                EventType::AddRule,
                serde_json::json!({
                    "rule": rule.id.0,
                    "user": user,
                    "destination": rule.destination.to_string(),
                    "port": rule.port,
                    "protocol": rule.protocol.as_str(),
                    "action": rule.action.as_ref(),
                }),
            )
            .await;
            println!("✓ Added rule #{} for '{user}'", rule.id);
            if let Some(note) = rule.port.and_then(check_well_known_port) {
                println!("  {note}");
            }
        }
        RuleCommand::Remove { id } => {
            let mut db = ctx.store.load().await?;
            let rule = db.delete_rule(RuleId(id))?;
            ctx.store.save(&db).await?;
            audit::log_change(
                &ctx.audit,
                EventType::RemoveRule,
                serde_json::json!({
                    "rule": rule.id.0,
                    "user_id": rule.user_id.0,
                }),
            )
            .await;
            println!("✓ Removed rule #{}", rule.id);
        }
        RuleCommand::List {
            user,
            protocol,
            action,
        } => {
            let db = ctx.store.load().await?;
            let names: HashMap<_, _> = db
                .users()
                .into_iter()
                .map(|u| (u.id, u.name.as_str()))
                .collect();
            let rules = db.rules(&RuleFilter {
                user,
                protocol,
                action,
            })?;
            if rules.is_empty() {
                println!("No rules.");
                return Ok(());
            }
            println!(
                "{:>5}  {:<16} {:<6} {:<5} {:<24} PORT",
                "ID", "USER", "ACTION", "PROTO", "DESTINATION"
            );
            for rule in rules {
                println!(
                    "{:>5}  {:<16} {:<6} {:<5} {:<24} {}",
                    rule.id.0,
                    names.get(&rule.user_id).copied().unwrap_or("?"),
                    rule.action.as_ref(),
                    rule.protocol.as_str(),
                    rule.destination.to_string(),
                    rule.port.map_or_else(|| "-".to_string(), |p| p.to_string())
                );
            }
        }
    }
    Ok(())
}

async fn validate(ctx: &Context, format: OutputFormat, check: bool) -> Result<ExitCode> {
    let set = match ctx.compile_current().await {
        Ok(set) => set,
        Err(e) => {
            audit::log_validate(&ctx.audit, false, 1, Some(e.to_string())).await;
            return Err(e);
        }
    };
    let batch = render_batch(&set);

    match format {
        OutputFormat::Text => {
            print!("{}", set.to_preview_text());
            println!("{} directives, checksum {}", set.len(), batch_checksum(&batch));
        }
        OutputFormat::Batch => print!("{batch}"),
    }

    if !check {
        audit::log_validate(&ctx.audit, true, 0, None).await;
        return Ok(ExitCode::SUCCESS);
    }

    // Diagnostics go to stderr so `--format batch` output stays loadable
    match ctx.applier().check(&set).await {
        Ok(result) if result.success => {
            for warning in &result.warnings {
                eprintln!("warning: {warning}");
            }
            eprintln!("✓ iptables-restore --test accepted the batch");
            audit::log_validate(&ctx.audit, true, 0, None).await;
            Ok(ExitCode::SUCCESS)
        }
        Ok(result) => {
            eprintln!("✗ iptables-restore --test rejected the batch:");
            for error in &result.errors {
                eprintln!("  {error}");
            }
            audit::log_validate(
                &ctx.audit,
                false,
                result.errors.len(),
                Some(result.errors.join("; ")),
            )
            .await;
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            audit::log_validate(&ctx.audit, false, 1, Some(e.to_string())).await;
            Err(e)
        }
    }
}

async fn apply(ctx: &Context, timeout: Option<u64>) -> Result<()> {
    // Compile first: a contradictory policy never reaches the kernel
    let set = ctx.compile_current().await?;
    let checksum = batch_checksum(&render_batch(&set));

    let lock_path = get_state_dir()
        .map(|dir| dir.join("apply.lock"))
        .ok_or_else(|| Error::Configuration("cannot determine the state directory".into()))?;
    let _lock = ApplyLock::acquire(&lock_path)?;

    let mut applier = ctx.applier();
    if let Some(secs) = timeout {
        applier = applier.with_timeout(Duration::from_secs(secs.max(1)));
    }

    if ctx.config.applier.elevate && !nix::unistd::getuid().is_root() {
        println!("Note: Not running as root. Will use sudo/run0/pkexec for apply.");
    }
    println!("Applying {} directives...", set.len());

    match applier.apply(&set).await {
        Ok(report) => {
            audit::log_apply(
                &ctx.audit,
                report.directives,
                &report.checksum,
                true,
                None,
            )
            .await;
            println!(
                "✓ Ruleset loaded ({} directives in {:.2?}, checksum {})",
                report.directives,
                report.elapsed,
                &report.checksum[..12]
            );
            Ok(())
        }
        Err(e) => {
            audit::log_apply(&ctx.audit, set.len(), &checksum, false, Some(e.to_string())).await;
            // No exit status means the outcome was never reported
            if matches!(
                e,
                Error::Apply {
                    exit_code: None,
                    stderr: None,
                    ..
                }
            ) {
                report_live_state(&applier, &set).await;
            }
            Err(e)
        }
    }
}

async fn report_live_state(applier: &PolicyApplier, set: &DirectiveSet) {
    eprintln!("Reading the live ruleset to find out what the kernel holds...");
    match applier.read_live().await {
        Ok(live) => {
            let report = compare_live(set, &live);
            if report.in_sync {
                eprintln!("The live ruleset matches the new policy: the load went through.");
            } else {
                eprintln!(
                    "The live ruleset does not match the new policy yet ({} expected lines, {} live). \
                     An interrupted elevated load can still commit; run `fwmgr verify` again \
                     before assuming the previous ruleset stayed in place.",
                    report.expected, report.live
                );
            }
        }
        Err(e) => eprintln!("Could not read the live ruleset: {e}"),
    }
}

async fn verify(ctx: &Context) -> Result<ExitCode> {
    let set = ctx.compile_current().await?;
    let live = match ctx.applier().read_live().await {
        Ok(live) => live,
        Err(e) => {
            audit::log_verify(&ctx.audit, false, Some(e.to_string())).await;
            return Err(e);
        }
    };

    let report = compare_live(&set, &live);
    audit::log_verify(&ctx.audit, report.in_sync, None).await;

    if report.hostname_rules > 0 {
        println!(
            "Note: {} rule(s) use hostname destinations, which the kernel stores resolved \
             and will always show as drift.",
            report.hostname_rules
        );
    }

    if report.in_sync {
        println!(
            "✓ Live ruleset matches the policy ({} owned rules)",
            report.expected
        );
        Ok(ExitCode::SUCCESS)
    } else {
        println!(
            "✗ Live ruleset differs from the policy ({} expected, {} live):",
            report.expected, report.live
        );
        print!("{}", report.diff);
        Ok(ExitCode::from(EXIT_DRIFT))
    }
}
