// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate log;

use anyhow::Result;
use clap::{crate_version, value_parser, Arg, ArgMatches, Command};
use std::path::PathBuf;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{EnumIter, EnumString, IntoStaticStr};

use covpool_task_lib::catalog::JsonCatalog;
use covpool_task_lib::tasks::config::GlobalConfig;
use covpool_task_lib::tasks::generate::{generate_report, TaskContext};
use covpool_task_lib::tasks::helper::HelperRegistry;
use covpool_task_lib::tasks::merge_task::{merge_convert_reports, merge_reports};

const CONFIG: &str = "config";
const CATALOG: &str = "catalog";
const FILE_ID: &str = "file_id";
const OUTPUT_DIR: &str = "output_dir";
const REPORT_ID: &str = "report_id";

#[derive(Clone, Copy, Debug, EnumIter, EnumString, Eq, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
enum Commands {
    GenerateReport,
    MergeReports,
    MergeConvertReports,
}

fn subcommand(cmd: Commands) -> Command {
    let name: &'static str = cmd.into();
    match cmd {
        Commands::GenerateReport => Command::new(name)
            .about("render and publish a report for one uploaded coverage file")
            .arg(
                Arg::new(FILE_ID)
                    .value_parser(value_parser!(u64))
                    .required(true),
            )
            .arg(
                Arg::new(OUTPUT_DIR)
                    .value_parser(value_parser!(PathBuf))
                    .required(true),
            ),
        Commands::MergeReports => Command::new(name)
            .about("merge same-version coverage files into one report")
            .arg(
                Arg::new(FILE_ID)
                    .value_parser(value_parser!(u64))
                    .num_args(1..)
                    .required(true),
            )
            .arg(
                Arg::new(OUTPUT_DIR)
                    .long("output-dir")
                    .value_parser(value_parser!(PathBuf))
                    .required(true),
            )
            .arg(
                Arg::new(REPORT_ID)
                    .long("report-id")
                    .value_parser(value_parser!(u64)),
            ),
        Commands::MergeConvertReports => Command::new(name)
            .about("extend a report with coverage files of any version")
            .arg(
                Arg::new(FILE_ID)
                    .value_parser(value_parser!(u64))
                    .num_args(1..)
                    .required(true),
            )
            .arg(
                Arg::new(OUTPUT_DIR)
                    .long("output-dir")
                    .value_parser(value_parser!(PathBuf))
                    .required(true),
            )
            .arg(
                Arg::new(REPORT_ID)
                    .long("report-id")
                    .value_parser(value_parser!(u64))
                    .required(true),
            ),
    }
}

async fn run(args: ArgMatches) -> Result<()> {
    let config_path = args
        .get_one::<PathBuf>(CONFIG)
        .ok_or_else(|| format_err!("missing --config"))?;
    let catalog_path = args
        .get_one::<PathBuf>(CATALOG)
        .ok_or_else(|| format_err!("missing --catalog"))?;

    let global = GlobalConfig::from_file(config_path)?;
    let catalog = JsonCatalog::open(catalog_path)?;
    let registry = HelperRegistry::builtin();

    let ctx = TaskContext {
        catalog: &catalog,
        registry: &registry,
        global: &global,
    };

    let (name, sub) = args
        .subcommand()
        .ok_or_else(|| format_err!("missing command"))?;
    let command =
        Commands::from_str(name).map_err(|_| format_err!("unknown command: {}", name))?;

    let output_dir = sub
        .get_one::<PathBuf>(OUTPUT_DIR)
        .ok_or_else(|| format_err!("missing output directory"))?;

    let report = match command {
        Commands::GenerateReport => {
            let file_id = *sub
                .get_one::<u64>(FILE_ID)
                .ok_or_else(|| format_err!("missing coverage file id"))?;
            generate_report(&ctx, file_id, output_dir).await?
        }
        Commands::MergeReports => {
            let file_ids: Vec<u64> = sub
                .get_many::<u64>(FILE_ID)
                .ok_or_else(|| format_err!("missing coverage file ids"))?
                .copied()
                .collect();
            let report_id = sub.get_one::<u64>(REPORT_ID).copied();
            merge_reports(&ctx, &file_ids, output_dir, report_id).await?
        }
        Commands::MergeConvertReports => {
            let file_ids: Vec<u64> = sub
                .get_many::<u64>(FILE_ID)
                .ok_or_else(|| format_err!("missing coverage file ids"))?
                .copied()
                .collect();
            let report_id = *sub
                .get_one::<u64>(REPORT_ID)
                .ok_or_else(|| format_err!("missing report id"))?;
            merge_convert_reports(&ctx, &file_ids, output_dir, report_id).await?
        }
    };

    info!("published report {} at {:?}", report.id, report.url);

    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut app = Command::new("covpool-task")
        .version(crate_version!())
        .subcommand_required(true)
        .arg(
            Arg::new(CONFIG)
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new(CATALOG)
                .long("catalog")
                .value_parser(value_parser!(PathBuf))
                .required(true),
        );

    for cmd in Commands::iter() {
        app = app.subcommand(subcommand(cmd));
    }

    let matches = app.get_matches();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(matches))
}
