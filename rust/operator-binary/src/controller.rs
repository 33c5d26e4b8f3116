//! Watches Certificates and reports, for each one, whether its Secret is up to date and what
//! cert-manager's issuing controller would have to do about it.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        api::{ListParams, PartialObjectMeta},
        runtime::{
            controller::{self, Action},
            metadata_watcher,
            reflector::{self, ObjectRef},
            watcher, Controller,
        },
    },
    logging::controller::ReconcilerError,
    namespace::WatchNamespace,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use time::OffsetDateTime;
use tokio::time::{error::Elapsed, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::{
    crd::{
        Certificate, CertificateRequest, CERTIFICATE_NAME_ANNOTATION,
        CERTIFICATE_REVISION_ANNOTATION,
    },
    lister::{self, FilteredSecretLister, SecretSelectors},
    policy::{self, renewal_time, Chain, Context, Input},
};

const CONTROLLER_NAME: &str = "certificate-policy";

/// How long to wait before retrying a failed reconciliation.
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(5);

pub struct ControllerOptions {
    pub policy: policy::Options,
    /// Upper bound for the API server calls of a single reconciliation.
    pub api_timeout: Duration,
    /// How often every Certificate is evaluated, even if nothing changed.
    pub requeue_interval: Duration,
}

type SecretLister = FilteredSecretLister<
    reflector::Store<Secret>,
    reflector::Store<PartialObjectMeta<Secret>>,
    stackable_operator::client::Client,
>;

struct Ctx {
    client: stackable_operator::client::Client,
    secrets: SecretLister,
    chain: Chain,
    options: ControllerOptions,
}

pub async fn start(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    options: ControllerOptions,
) {
    let selectors = SecretSelectors::part_of_cert_manager();
    let owned_selector = selectors.owned.to_string();
    let unowned_selector = selectors.unowned.to_string();

    let (owned_secrets, owned_secrets_writer) = reflector::store();
    let owned_secrets_reflector = reflector::reflector(
        owned_secrets_writer,
        watcher(
            watch_namespace.get_api::<Secret>(client),
            watcher::Config::default().labels(&owned_selector),
        ),
    )
    .for_each(|event| async move {
        if let Err(error) = event {
            warn!(
                error = &error as &dyn std::error::Error,
                "failed to watch cert-manager Secrets"
            );
        }
    });
    let (unowned_secrets, unowned_secrets_writer) = reflector::store();
    let unowned_secrets_reflector = reflector::reflector(
        unowned_secrets_writer,
        metadata_watcher(
            watch_namespace.get_api::<Secret>(client),
            watcher::Config::default().labels(&unowned_selector),
        ),
    )
    .for_each(|event| async move {
        if let Err(error) = event {
            warn!(
                error = &error as &dyn std::error::Error,
                "failed to watch metadata of other Secrets"
            );
        }
    });

    info!(
        chain = ?Chain::full().check_names().collect::<Vec<_>>(),
        field_manager = %options.policy.field_manager,
        owner_references_enabled = options.policy.owner_references_enabled,
        "starting {CONTROLLER_NAME} controller"
    );
    let controller = Controller::new(
        watch_namespace.get_api::<Certificate>(client),
        watcher::Config::default(),
    )
    .watches(
        watch_namespace.get_api::<Secret>(client),
        watcher::Config::default().labels(&owned_selector),
        secret_certificate,
    )
    .shutdown_on_signal()
    .run(
        reconcile,
        error_policy,
        Arc::new(Ctx {
            client: client.clone(),
            secrets: FilteredSecretLister::new(
                owned_secrets,
                unowned_secrets,
                client.clone(),
                selectors,
            ),
            chain: Chain::full(),
            options,
        }),
    )
    .for_each_concurrent(16, |res| async move {
        match res {
            Ok((certificate, action)) => debug!(%certificate, ?action, "reconciled"),
            Err(controller::Error::ReconcilerFailed(error, certificate)) => warn!(
                %certificate,
                category = error.category(),
                error = &error as &dyn std::error::Error,
                "failed to evaluate certificate policy"
            ),
            Err(error) => warn!(
                error = &error as &dyn std::error::Error,
                "controller error"
            ),
        }
    });

    tokio::select! {
        _ = controller => {}
        _ = owned_secrets_reflector => {}
        _ = unowned_secrets_reflector => {}
    }
}

/// Maps a Secret to the Certificate that it was issued for.
fn secret_certificate(secret: Secret) -> Option<ObjectRef<Certificate>> {
    let certificate = secret
        .metadata
        .annotations?
        .remove(CERTIFICATE_NAME_ANNOTATION)?;
    Some(ObjectRef::new(&certificate).within(secret.metadata.namespace.as_deref()?))
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("Certificate has no associated Namespace"))]
    NoCertificateNamespace,

    #[snafu(display("failed to get {secret}"))]
    GetSecret {
        source: lister::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to list CertificateRequests"))]
    ListCertificateRequests {
        source: stackable_operator::client::Error,
    },

    #[snafu(display("timed out listing CertificateRequests"))]
    ListCertificateRequestsTimeout { source: Elapsed },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<stackable_operator::kube::api::DynamicObject>> {
        match self {
            Error::NoCertificateNamespace => None,
            Error::GetSecret { secret, .. } => Some(secret.clone().erase()),
            Error::ListCertificateRequests { .. } => None,
            Error::ListCertificateRequestsTimeout { .. } => None,
        }
    }
}

async fn reconcile(certificate: Arc<Certificate>, ctx: Arc<Ctx>) -> Result<Action> {
    let namespace = certificate
        .metadata
        .namespace
        .as_deref()
        .context(NoCertificateNamespaceSnafu)?;
    let deadline = Instant::now() + ctx.options.api_timeout;

    let secret_name = &certificate.spec.secret_name;
    let secret = ctx
        .secrets
        .get(namespace, secret_name, deadline)
        .await
        .context(GetSecretSnafu {
            secret: ObjectRef::<Secret>::new(secret_name).within(namespace),
        })?;
    let requests = timeout_at(
        deadline,
        ctx.client
            .list::<CertificateRequest>(namespace, &ListParams::default()),
    )
    .await
    .context(ListCertificateRequestsTimeoutSnafu)?
    .context(ListCertificateRequestsSnafu)?;

    let now = OffsetDateTime::now_utc();
    let input = Input {
        certificate: &certificate,
        secret: secret.as_ref(),
        current_request: current_request(&certificate, &requests),
        now,
    };
    let policy_ctx = Context::new(&input, &ctx.options.policy);
    let certificate_ref = ObjectRef::from_obj(&*certificate);
    match ctx.chain.evaluate_context(&policy_ctx) {
        Some(violation) => {
            info!(
                certificate = %certificate_ref,
                reason = %violation.reason,
                remediation = %violation.reason.remediation(),
                details = %violation.message,
                "Secret is not up to date"
            );
            Ok(Action::requeue(ctx.options.requeue_interval))
        }
        None => {
            let renewal = policy_ctx.secret_state.as_ref().ok().map(|state| {
                renewal_time(state.not_before, state.not_after, &certificate.spec)
            });
            debug!(certificate = %certificate_ref, ?renewal, "Secret is up to date");
            Ok(Action::requeue(next_evaluation(
                renewal,
                now,
                ctx.options.requeue_interval,
            )))
        }
    }
}

fn error_policy(_obj: Arc<Certificate>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

/// The CertificateRequest that the Certificate's current revision was issued from.
///
/// Only requests controlled by the Certificate count, so that a recreated Certificate with the
/// same name never picks up its predecessor's requests.
pub fn current_request<'a>(
    certificate: &Certificate,
    requests: &'a [CertificateRequest],
) -> Option<&'a CertificateRequest> {
    let revision = certificate.status.as_ref()?.revision?;
    let uid = certificate.metadata.uid.as_deref()?;
    requests.iter().find(|request| {
        let controlled = request
            .metadata
            .owner_references
            .iter()
            .flatten()
            .any(|owner| owner.controller == Some(true) && owner.uid == uid);
        let request_revision = request
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(CERTIFICATE_REVISION_ANNOTATION))
            .and_then(|revision| revision.parse::<u64>().ok());
        controlled && request_revision == Some(revision)
    })
}

/// When an up-to-date Certificate should be looked at again: at its renewal time, but at least
/// every `interval`.
fn next_evaluation(
    renewal: Option<OffsetDateTime>,
    now: OffsetDateTime,
    interval: Duration,
) -> Duration {
    renewal
        .and_then(|renewal| Duration::try_from(renewal - now).ok())
        .map_or(interval, |until_renewal| until_renewal.min(interval))
}
