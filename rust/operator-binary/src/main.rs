use clap::{crate_description, crate_version, Parser};
use stackable_certificate_policy::{
    controller::{self, ControllerOptions},
    crd::{Certificate, CertificateRequest},
    policy::{self, DEFAULT_FIELD_MANAGER},
};
use stackable_operator::{
    logging::TracingTarget, namespace::WatchNamespace, time::Duration, CustomResourceExt,
};

pub const APP_NAME: &str = "certificate-policy";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<CertificatePolicyRun>,
}

#[derive(clap::Parser)]
struct CertificatePolicyRun {
    /// Only watch Certificates in this namespace (all namespaces if empty)
    #[arg(long, env, default_value = "")]
    watch_namespace: WatchNamespace,

    /// Server-side apply field manager that owns the Secret fields written by cert-manager
    #[arg(long, env, default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,

    /// Expect Secrets to be owned by their Certificate
    #[arg(long, env)]
    enable_certificate_owner_ref: bool,

    /// Upper bound for the API server calls made while evaluating a single Certificate
    #[arg(long, env, default_value = "30s")]
    api_timeout: Duration,

    /// How often up-to-date Certificates are evaluated again
    #[arg(long, env, default_value = "5m")]
    requeue_interval: Duration,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
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
            Certificate::print_yaml_schema()?;
            CertificateRequest::print_yaml_schema()?;
        }
        stackable_operator::cli::Command::Run(CertificatePolicyRun {
            watch_namespace,
            field_manager,
            enable_certificate_owner_ref,
            api_timeout,
            requeue_interval,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "CERTIFICATE_POLICY_LOG",
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
            let client = stackable_operator::client::create_client(Some(
                "certificate-policy.stackable.tech".to_string(),
            ))
            .await?;
            controller::start(
                &client,
                &watch_namespace,
                ControllerOptions {
                    policy: policy::Options {
                        field_manager,
                        owner_references_enabled: enable_certificate_owner_ref,
                    },
                    api_timeout: *api_timeout,
                    requeue_interval: *requeue_interval,
                },
            )
            .await;
        }
    }
    Ok(())
}
