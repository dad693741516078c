use {
    anyhow::bail,
    cadence_config::{CadenceConfig, LedgerBackend},
    cadence_cron::ledger_sqlite::SqliteLedger,
    clap::Subcommand,
};

#[derive(Subcommand)]
pub enum DbAction {
    /// Run all pending ledger migrations.
    Migrate,
    /// Delete every recorded run but keep the schema intact.
    Clear,
}

pub async fn handle_db(config: &CadenceConfig, action: DbAction) -> anyhow::Result<()> {
    if config.ledger.backend != LedgerBackend::Sqlite {
        bail!("`cadence db` needs the sqlite ledger backend");
    }
    let url = &config.ledger.database_url;

    match action {
        DbAction::Migrate => {
            // Opening the ledger applies pending migrations.
            SqliteLedger::new(url).await?;
            println!("Ledger database is up to date: {url}");
        },
        DbAction::Clear => {
            let removed = SqliteLedger::new(url).await?.clear().await?;
            println!("Deleted {removed} run record(s) from {url}");
        },
    }
    Ok(())
}
