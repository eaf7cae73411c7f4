use super::emit;
use crate::config::Config;
use crate::OutputFormat;
use anyhow::Result;
use clap::Subcommand;
use txhouse_core::TableSchema;
use txhouse_storage::{Catalog, SchemaStatement, StatementOutcome};

#[derive(Subcommand)]
pub enum SchemaCommands {
    /// Drop and recreate the transactions table (all data is lost)
    Reset,
    /// Print the transactions table definition
    Show,
}

pub async fn handle(command: SchemaCommands, config: &Config, format: OutputFormat) -> Result<()> {
    match command {
        SchemaCommands::Reset => {
            let catalog = Catalog::open(config.store.clone()).await?;
            let statements = SchemaStatement::transactions_ddl();
            let outcomes = catalog.execute_all(statements.clone()).await?;
            let report: Vec<String> = statements
                .iter()
                .zip(&outcomes)
                .map(|(statement, outcome)| describe(statement, *outcome))
                .collect();
            emit(format, &report, |lines| {
                for line in lines {
                    println!("{}", line);
                }
            })
        }
        SchemaCommands::Show => {
            let schema = TableSchema::transactions();
            emit(format, &schema, |schema| {
                println!("table {}", schema.name);
                let columns: Vec<String> = schema.columns.iter().map(|c| c.to_string()).collect();
                println!("  columns:  {}", columns.join(", "));
                let order: Vec<String> = schema
                    .order_by
                    .columns
                    .iter()
                    .map(|c| {
                        if c.descending {
                            format!("{} desc", c.column)
                        } else {
                            c.column.to_string()
                        }
                    })
                    .collect();
                println!("  order by: {}", order.join(", "));
                println!("  partition by: toYYYYMM(transaction_date)");
                for index in &schema.skip_indexes {
                    println!(
                        "  bloom index on {} (fp rate {})",
                        index.column, index.false_positive_rate
                    );
                }
            })
        }
    }
}

fn describe(statement: &SchemaStatement, outcome: StatementOutcome) -> String {
    let target = match statement {
        SchemaStatement::CreateTable { schema, .. } => format!("create table {}", schema.name),
        SchemaStatement::DropTable { name, .. } => format!("drop table {}", name),
    };
    let result = match outcome {
        StatementOutcome::Created => "created",
        StatementOutcome::Dropped => "dropped",
        StatementOutcome::Unchanged => "unchanged",
    };
    format!("{}: {}", target, result)
}
