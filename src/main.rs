//! tronclass-enhancer - Main Entry Point
//!
//! Command-line front end: inspects and edits persisted feature flags, and
//! simulates in-app navigation on a page model to show which features apply.

use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tronclass_enhancer::{
    browser::{Page, StaticTransport},
    config::{CliArgs, EnhancerSettings},
    feature::{FeatureManager, FeaturePhase},
    modules::register_builtin_modules,
    services::Services,
    state::{FileStorage, MemoryStorage, StorageBackend},
    NAME, VERSION,
};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
}

/// Build the CLI command parser
fn build_cli() -> Command {
    Command::new(NAME)
        .version(VERSION)
        .about("Feature engine for the TronClass learning platform")
        .long_about(
            "tronclass-enhancer manages the feature modules injected into TronClass pages:\n\
             - Inspect modules, groups and features with their persisted flags\n\
             - Toggle, set or reset flags\n\
             - Simulate in-app navigation and watch route-aware features re-apply",
        )
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file (TOML or JSON)")
                .global(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("storage-dir")
                .long("storage-dir")
                .value_name("DIR")
                .help("Directory holding persisted state (in-memory when omitted)")
                .global(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("url")
                .short('u')
                .long("url")
                .value_name("URL")
                .help("Page URL the features run on")
                .global(true),
        )
        .arg(
            Arg::new("lang")
                .short('l')
                .long("lang")
                .value_name("LANG")
                .help("Label language, e.g. zh-TW or en-US")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .global(true)
                .action(ArgAction::Count),
        )
        .subcommand(Command::new("status").about("List modules, features, flags and applicability"))
        .subcommand(
            Command::new("toggle")
                .about("Flip a feature flag")
                .arg(Arg::new("module").required(true))
                .arg(Arg::new("group").required(true))
                .arg(Arg::new("feature").required(true)),
        )
        .subcommand(
            Command::new("set")
                .about("Set a feature flag")
                .arg(Arg::new("module").required(true))
                .arg(Arg::new("group").required(true))
                .arg(Arg::new("feature").required(true))
                .arg(
                    Arg::new("value")
                        .required(true)
                        .value_parser(clap::value_parser!(bool)),
                ),
        )
        .subcommand(
            Command::new("reset")
                .about("Restore default flags of one module, or of every module")
                .arg(Arg::new("module")),
        )
        .subcommand(
            Command::new("simulate")
                .about("Initialise every module and walk the given routes")
                .arg(Arg::new("routes").required(true).num_args(1..)),
        )
}

/// Parse CLI arguments into CliArgs struct
fn parse_cli_args(matches: &ArgMatches) -> CliArgs {
    CliArgs {
        config_file: matches.get_one::<PathBuf>("config").cloned(),
        storage_dir: matches.get_one::<PathBuf>("storage-dir").cloned(),
        page_url: matches.get_one::<String>("url").cloned(),
        language: matches.get_one::<String>("lang").cloned(),
    }
}

/// Initialize the tracing/logging subsystem
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Page, services and modules of one run.
async fn build_session(settings: &EnhancerSettings) -> Result<Arc<FeatureManager>> {
    let page = Page::new(&settings.page_url, Arc::new(StaticTransport::new()))
        .with_context(|| format!("Failed to load page {}", settings.page_url))?;

    let storage: Arc<dyn StorageBackend> = match settings.storage_dir {
        Some(ref dir) => Arc::new(FileStorage::new(dir)),
        None => Arc::new(MemoryStorage::new()),
    };

    let mut services = Services::with_storage(page, storage)
        .context("Failed to create services")?
        .with_storage_prefix(settings.storage_prefix.clone())
        .with_dom_wait_timeout(settings.dom_wait_timeout());
    if let Some(ref language) = settings.language {
        services = services.with_language(language);
    }
    services.install_hooks().context("Failed to install page hooks")?;

    let manager = Arc::new(
        FeatureManager::new(Arc::new(services))
            .with_route_timing(settings.route_debounce(), settings.route_throttle()),
    );
    register_builtin_modules(&manager).context("Failed to register modules")?;
    for module in manager.modules() {
        module.load().await;
    }
    debug!("Session ready on {}", settings.page_url);
    Ok(manager)
}

fn flag(enabled: bool) -> String {
    if enabled {
        format!("{}on{}", colors::GREEN, colors::RESET)
    } else {
        format!("{}off{}", colors::YELLOW, colors::RESET)
    }
}

async fn print_status(manager: &FeatureManager) {
    let language = manager.services().language().to_string();
    let route = manager.services().page().route();
    println!(
        "{bold}{cyan}{}{reset} {dim}({}, {}){reset}",
        manager.services().page().location().href(),
        route.pathname,
        language,
        bold = colors::BOLD,
        cyan = colors::CYAN,
        dim = colors::DIM,
        reset = colors::RESET
    );

    for module in manager.modules() {
        let label = module.label(&language);
        println!(
            "\n{bold}{}{reset} [{}] {}",
            label.name,
            module.id(),
            flag(module.is_enabled()),
            bold = colors::BOLD,
            reset = colors::RESET
        );
        for group in module.groups() {
            println!("  {}", module.group_label(&language, group.id()));
            for feature in group.features() {
                let info = feature.info();
                let label = module.feature_label(&language, group.id(), &info.path.feature);
                let applicable = if feature.check().await {
                    String::new()
                } else {
                    format!(" {}(not applicable here){}", colors::DIM, colors::RESET)
                };
                println!(
                    "    {:<4} {} {dim}[{}]{reset}{}",
                    flag(feature.enabled()),
                    label.name,
                    info.path.feature,
                    applicable,
                    dim = colors::DIM,
                    reset = colors::RESET
                );
            }
        }
    }
}

async fn set_flag(
    manager: &FeatureManager,
    module: &str,
    group: &str,
    feature: &str,
    value: bool,
) -> Result<bool> {
    let module = manager.module(module)?;
    let unit = module
        .feature(group, feature)
        .with_context(|| format!("Unknown feature {}.{}.{}", module.id(), group, feature))?;
    if !unit.info().persisted {
        bail!("{} has no persisted flag", unit.info().path);
    }
    if unit.enabled() != value {
        module.click(group, feature).await?;
    }
    Ok(unit.enabled())
}

async fn simulate(manager: &Arc<FeatureManager>, routes: &[String]) -> Result<()> {
    manager.init_all().await;
    print_applied(manager, "initial");

    let history = manager.services().page().history();
    for route in routes {
        history
            .push_state(route)
            .with_context(|| format!("Invalid route {}", route))?;
        let count = manager.handle_route_change().await;
        info!("{} re-evaluated {} features", route, count);
        print_applied(manager, route);
    }
    Ok(())
}

fn print_applied(manager: &FeatureManager, step: &str) {
    let applied: Vec<String> = manager
        .modules()
        .iter()
        .flat_map(|module| {
            module
                .features()
                .filter(|f| f.phase() == FeaturePhase::Applied { enabled: true })
                .map(|f| f.info().path.to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    println!(
        "{bold}{}{reset} {dim}->{reset} {}",
        step,
        if applied.is_empty() {
            "(none)".to_string()
        } else {
            applied.join(", ")
        },
        bold = colors::BOLD,
        dim = colors::DIM,
        reset = colors::RESET
    );
}

fn feature_args(matches: &ArgMatches) -> Result<(&str, &str, &str)> {
    let get = |name: &str| {
        matches
            .get_one::<String>(name)
            .map(String::as_str)
            .with_context(|| format!("Missing argument {}", name))
    };
    Ok((get("module")?, get("group")?, get("feature")?))
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    init_tracing(matches.get_count("verbose"));

    let settings = parse_cli_args(&matches)
        .load_settings()
        .context("Failed to load configuration")?;
    let manager = build_session(&settings).await?;

    match matches.subcommand() {
        Some(("status", _)) => print_status(&manager).await,
        Some(("toggle", sub)) => {
            let (module, group, feature) = feature_args(sub)?;
            let value = manager
                .module(module)?
                .click(group, feature)
                .await
                .with_context(|| format!("Failed to toggle {}.{}.{}", module, group, feature))?;
            match value {
                Some(value) => println!("{}.{}.{} = {}", module, group, feature, flag(value)),
                None => println!("{}.{}.{} clicked", module, group, feature),
            }
        }
        Some(("set", sub)) => {
            let (module, group, feature) = feature_args(sub)?;
            let value = sub.get_one::<bool>("value").copied().unwrap_or_default();
            let value = set_flag(&manager, module, group, feature, value).await?;
            println!("{}.{}.{} = {}", module, group, feature, flag(value));
        }
        Some(("reset", sub)) => {
            let modules = match sub.get_one::<String>("module") {
                Some(id) => vec![manager.module(id)?],
                None => manager.modules(),
            };
            for module in modules {
                let changed = module.reset().await?;
                println!("{}: {} flags restored", module.id(), changed.len());
            }
        }
        Some(("simulate", sub)) => {
            let routes: Vec<String> = sub
                .get_many::<String>("routes")
                .map(|routes| routes.cloned().collect())
                .unwrap_or_default();
            simulate(&manager, &routes).await?;
        }
        Some((other, _)) => bail!("Unknown command {}", other),
        None => bail!("No command given"),
    }

    manager.dispose().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let matches = build_cli()
            .try_get_matches_from([
                "tc-enhancer",
                "--url",
                "https://lms.example.edu/course/1/learning-activity",
                "toggle",
                "course",
                "learning-activity",
                "autoNext",
                "-v",
            ])
            .unwrap();

        assert_eq!(matches.get_count("verbose"), 1);
        let args = parse_cli_args(&matches);
        assert_eq!(
            args.page_url.as_deref(),
            Some("https://lms.example.edu/course/1/learning-activity")
        );
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(feature_args(sub).unwrap(), ("course", "learning-activity", "autoNext"));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(build_cli().try_get_matches_from(["tc-enhancer"]).is_err());
    }

    #[test]
    fn test_set_value_parsing() {
        let matches = build_cli()
            .try_get_matches_from(["tc-enhancer", "set", "exam", "mark", "examMark", "false"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(sub.get_one::<bool>("value"), Some(&false));

        assert!(build_cli()
            .try_get_matches_from(["tc-enhancer", "set", "exam", "mark", "examMark", "maybe"])
            .is_err());
    }

    #[tokio::test]
    async fn test_session_status_and_set() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EnhancerSettings::default()
            .with_page_url("https://lms.example.edu/exam/3")
            .with_storage_dir(dir.path())
            .with_dom_wait_timeout(10);

        let manager = build_session(&settings).await.unwrap();
        assert!(!set_flag(&manager, "exam", "mark", "examMark", false).await.unwrap());
        assert!(set_flag(&manager, "missing", "mark", "examMark", false).await.is_err());
        manager.dispose().await;

        let manager = build_session(&settings).await.unwrap();
        assert!(!manager.module("exam").unwrap().is_feature_enabled("mark", "examMark"));
        print_status(&manager).await;
    }
}
