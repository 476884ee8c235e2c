use clap::{crate_description, crate_version, Parser};
use dbcluster_pki_operator::{controller, crd::DatabaseCluster, pki::PkiConfig, OPERATOR_NAME};
use stackable_operator::{
    logging::TracingTarget, namespace::WatchNamespace, time::Duration, CustomResourceExt,
};

pub const APP_NAME: &str = "dbcluster-pki";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<PkiOperatorRun>,
}

#[derive(clap::Parser)]
struct PkiOperatorRun {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    watch_namespace: WatchNamespace,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    tracing_target: TracingTarget,

    /// Upper bound for setting up the PKI of a single DatabaseCluster
    #[arg(long, env, default_value = "1m")]
    reconcile_timeout: Duration,

    #[command(flatten)]
    pki: PkiConfig,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            DatabaseCluster::print_yaml_schema()?;
        }
        stackable_operator::cli::Command::Run(PkiOperatorRun {
            watch_namespace,
            tracing_target,
            reconcile_timeout,
            pki,
        }) => {
            stackable_operator::logging::initialize_logging(
                "DBCLUSTER_PKI_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            tracing::info!(
                certificate_lifetime = %pki.certificate_lifetime,
                renewal_threshold = %pki.renewal_threshold,
                leaf_key_policy = %pki.leaf_key_policy,
                "starting PKI controller"
            );
            let client =
                stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string())).await?;
            controller::start(&client, &watch_namespace, pki, *reconcile_timeout).await;
        }
    }
    Ok(())
}
