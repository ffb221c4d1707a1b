use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use redmigrate_core::assembla::{AssemblaApi, AssemblaClient, AssemblaClientConfig};
use redmigrate_core::assets::AssetStore;
use redmigrate_core::config::{DEFAULT_ASSETS_DIR, MigrationConfig, load_config};
use redmigrate_core::migrate::{
    PageMigrationReport, TicketMigrationReport, migrate_tickets, migrate_wiki_pages,
};
use redmigrate_core::redmine::{RedmineApi, RedmineClient, RedmineClientConfig};

#[derive(Debug, Parser)]
#[command(
    name = "redmigrate",
    version,
    about = "Migrate an Assembla space (wiki pages, tickets, images) into a Redmine project"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        default_value = "redmigrate.toml"
    )]
    config: PathBuf,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Directory downloaded images are written into"
    )]
    assets_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Print reports as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Migrate wiki pages")]
    Pages,
    #[command(about = "Migrate tickets and their comments")]
    Tickets,
    #[command(about = "Migrate wiki pages, then tickets")]
    All,
    #[command(about = "List the Assembla spaces and Redmine projects visible to the configured keys")]
    Inspect,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let store = AssetStore::new(
        cli.assets_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ASSETS_DIR)),
    );

    match cli.command {
        Commands::Pages => run_pages(&config, &store, cli.json),
        Commands::Tickets => run_tickets(&config, &store, cli.json),
        Commands::All => {
            run_pages(&config, &store, cli.json)?;
            run_tickets(&config, &store, cli.json)
        }
        Commands::Inspect => run_inspect(&config),
    }
}

fn run_pages(config: &MigrationConfig, store: &AssetStore, json: bool) -> Result<()> {
    store.ensure_dir()?;
    let mut api = AssemblaClient::new(AssemblaClientConfig::from_config(config)?)?;
    let mut redmine = RedmineClient::new(RedmineClientConfig::from_config(config)?)?;

    let report = migrate_wiki_pages(&mut api, &mut redmine, store)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    print_page_report(&report, &api, &redmine);
    Ok(())
}

fn run_tickets(config: &MigrationConfig, store: &AssetStore, json: bool) -> Result<()> {
    store.ensure_dir()?;
    let mut api = AssemblaClient::new(AssemblaClientConfig::from_config(config)?)?;
    let mut redmine = RedmineClient::new(RedmineClientConfig::from_config(config)?)?;

    let report = migrate_tickets(&mut api, &mut redmine, store, config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    print_ticket_report(&report, &api, &redmine);
    Ok(())
}

fn run_inspect(config: &MigrationConfig) -> Result<()> {
    let mut api = AssemblaClient::new(AssemblaClientConfig::from_config(config)?)?;
    let spaces = api.spaces()?;
    println!("assembla spaces: {}", spaces.len());
    for space in spaces {
        println!("  {} ({})", space.name, space.id);
    }

    let mut redmine = RedmineClient::new(RedmineClientConfig::from_config(config)?)?;
    let projects = redmine.projects()?;
    println!("redmine projects: {}", projects.len());
    for project in projects {
        println!("  {} ({})", project.identifier, project.name);
    }
    Ok(())
}

fn print_page_report(report: &PageMigrationReport, api: &impl AssemblaApi, redmine: &impl RedmineApi) {
    println!("migrated wiki pages");
    for page in &report.pages {
        match &page.detail {
            Some(detail) => println!("  [{}] {} ({detail})", page.action, page.title),
            None => println!("  [{}] {}", page.action, page.title),
        }
    }
    println!("requested: {}", report.requested);
    println!("created: {}", report.created);
    println!("updated: {}", report.updated);
    println!("skipped: {}", report.skipped);
    println!("stranded: {}", report.stranded);
    println!(
        "requests: {} assembla, {} redmine",
        api.request_count(),
        redmine.request_count()
    );
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  {error}");
        }
    }
}

fn print_ticket_report(
    report: &TicketMigrationReport,
    api: &impl AssemblaApi,
    redmine: &impl RedmineApi,
) {
    println!("migrated tickets");
    for ticket in &report.tickets {
        match &ticket.detail {
            Some(detail) => println!(
                "  [{}] #{} {} ({detail})",
                ticket.action, ticket.number, ticket.subject
            ),
            None => println!("  [{}] #{} {}", ticket.action, ticket.number, ticket.subject),
        }
    }
    println!("requested: {}", report.requested);
    println!("migrated: {}", report.migrated);
    println!("skipped: {}", report.skipped);
    println!("comments applied: {}", report.comments_applied);
    println!(
        "requests: {} assembla, {} redmine",
        api.request_count(),
        redmine.request_count()
    );
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  {error}");
        }
    }
}
