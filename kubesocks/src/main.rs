//! Run a throwaway SOCKS5 proxy pod in a Kubernetes cluster, and forward a
//! local port to it.

use kubesocks_common::{
    interrupt,
    kubernetes::{self, Kubectl},
    manifest::proxy_pod_manifest,
    orchestrator::{Orchestrator, WaitPolicy},
    prelude::*,
    quick_main,
    session::ProxySession,
    tracing_support::initialize_tracing,
};
use structopt::StructOpt;

/// Command-line options, parsed using `structopt`.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "kubesocks",
    about = "Tunnel into a Kubernetes cluster through a temporary SOCKS5 proxy pod."
)]
struct Opt {
    /// The namespace to run the proxy pod in.
    #[structopt(
        short = "n",
        long = "namespace",
        default_value = "default",
        env = "KUBESOCKS_NAMESPACE"
    )]
    namespace: String,

    /// The port the proxy listens on inside the pod.
    #[structopt(
        short = "p",
        long = "pod-port",
        default_value = "1080",
        env = "KUBESOCKS_POD_PORT"
    )]
    pod_port: u16,

    /// The name of the proxy pod. An existing pod with this name is reused.
    #[structopt(
        short = "N",
        long = "name",
        default_value = "psocks1080",
        env = "KUBESOCKS_NAME"
    )]
    name: String,

    /// The SOCKS5 proxy image to run.
    #[structopt(
        short = "i",
        long = "image",
        default_value = "serjs/go-socks5-proxy",
        env = "KUBESOCKS_IMAGE"
    )]
    image: String,

    /// Leave the proxy pod running when we exit.
    #[structopt(long = "skip-cleanup-proxy")]
    skip_cleanup_proxy: bool,

    /// The kubectl context to use. Defaults to your current context.
    #[structopt(short = "c", long = "context", env = "KUBESOCKS_CONTEXT")]
    context: Option<String>,

    /// The local port to forward to the proxy.
    #[structopt(
        short = "l",
        long = "local-port",
        default_value = "1080",
        env = "KUBESOCKS_LOCAL_PORT"
    )]
    local_port: u16,

    /// How many times to check whether a new pod is running, one second
    /// apart.
    #[structopt(
        long = "wait-attempts",
        default_value = "10",
        env = "KUBESOCKS_WAIT_ATTEMPTS"
    )]
    wait_attempts: u32,

    /// Give up if a new pod isn't running after --wait-attempts checks,
    /// instead of trying to forward anyway.
    #[structopt(long = "fail-on-timeout")]
    fail_on_timeout: bool,

    /// Just print out the pod manifest without touching the cluster.
    #[structopt(long = "dry-run")]
    dry_run: bool,
}

impl Opt {
    /// Build our session, calling `current_context` only if no context was
    /// specified.
    fn into_session<F>(self, current_context: F) -> Result<ProxySession>
    where
        F: FnOnce() -> Result<String>,
    {
        let context = match self.context {
            Some(context) => context,
            None => current_context()?,
        };
        Ok(ProxySession {
            context,
            namespace: self.namespace,
            pod_name: self.name,
            pod_port: self.pod_port,
            local_port: self.local_port,
            image: self.image,
            skip_cleanup: self.skip_cleanup_proxy,
        })
    }

    /// How long should we wait for new pods?
    fn wait_policy(&self) -> Result<WaitPolicy> {
        if self.wait_attempts == 0 {
            return Err(format_err!("--wait-attempts must be at least 1"));
        }
        Ok(WaitPolicy {
            attempts: self.wait_attempts,
            fail_on_timeout: self.fail_on_timeout,
            ..WaitPolicy::default()
        })
    }
}

/// The context we put in a dry-run session when none was given. Rendering a
/// manifest never looks at it.
const DRY_RUN_CONTEXT: &str = "current-context";

/// Render the manifest we would apply, without needing `kubectl`.
fn dry_run(opt: Opt) -> Result<String> {
    let session = opt.into_session(|| Ok(DRY_RUN_CONTEXT.to_owned()))?;
    session.validate()?;
    proxy_pod_manifest(&session)
}

/// Our real entry point.
fn run() -> Result<()> {
    let opt = Opt::from_args();
    initialize_tracing();
    debug!("Args: {:?}", opt);

    let wait = opt.wait_policy()?;
    if opt.dry_run {
        print!("{}", dry_run(opt)?);
        return Ok(());
    }

    kubernetes::ensure_kubectl_installed()?;
    let session = opt.into_session(kubernetes::current_context)?;
    session.validate()?;
    debug!("session: {:?}", session);

    interrupt::install_handlers()?;
    let outcome = Orchestrator::new(Kubectl, wait).run(&session)?;
    debug!(final_state = %outcome.final_state, "session finished");
    Ok(())
}

quick_main!(run);

#[cfg(test)]
mod tests {
    use kubesocks_common::session::{
        DEFAULT_IMAGE, DEFAULT_NAMESPACE, DEFAULT_POD_NAME, DEFAULT_PORT,
    };
    use structopt::clap::ErrorKind;

    use super::*;

    fn parse(args: &[&str]) -> Opt {
        let mut argv = vec!["kubesocks"];
        argv.extend_from_slice(args);
        Opt::from_iter_safe(argv).unwrap()
    }

    fn ambient() -> Result<String> {
        Ok("kind-dev".to_owned())
    }

    #[test]
    fn defaults() {
        let session = parse(&[]).into_session(ambient).unwrap();
        assert_eq!(
            session,
            ProxySession {
                context: "kind-dev".to_owned(),
                namespace: DEFAULT_NAMESPACE.to_owned(),
                pod_name: DEFAULT_POD_NAME.to_owned(),
                pod_port: DEFAULT_PORT,
                local_port: DEFAULT_PORT,
                image: DEFAULT_IMAGE.to_owned(),
                skip_cleanup: false,
            },
        );
        assert_eq!(session, ProxySession::with_defaults("kind-dev"));
    }

    #[test]
    fn short_flags() {
        let session = parse(&[
            "-n",
            "team-a",
            "-p",
            "9050",
            "-l",
            "9051",
            "-N",
            "myproxy",
            "--skip-cleanup-proxy",
        ])
        .into_session(ambient)
        .unwrap();
        assert_eq!(session.namespace, "team-a");
        assert_eq!(session.pod_port, 9050);
        assert_eq!(session.local_port, 9051);
        assert_eq!(session.pod_name, "myproxy");
        assert!(session.skip_cleanup);
        assert_eq!(session.context, "kind-dev");
    }

    #[test]
    fn explicit_context_skips_ambient_lookup() {
        let session = parse(&["-c", "prod", "-i", "example.com/socks:1"])
            .into_session(|| -> Result<String> { panic!("looked up current context") })
            .unwrap();
        assert_eq!(session.context, "prod");
        assert_eq!(session.image, "example.com/socks:1");
    }

    #[test]
    fn ambient_context_errors_propagate() {
        let result = parse(&[])
            .into_session(|| Err(format_err!("no current Kubernetes context is set")));
        assert!(result.is_err());
    }

    #[test]
    fn dry_run_needs_no_context() {
        let manifest = dry_run(parse(&["--dry-run", "-N", "myproxy"])).unwrap();
        assert!(manifest.contains("name: \"myproxy\""));
        assert!(!manifest.contains(DRY_RUN_CONTEXT));

        assert!(dry_run(parse(&["--dry-run", "-N", "Bad_Name"])).is_err());
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let err = Opt::from_iter_safe(&["kubesocks", "--bogus"]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownArgument);
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(Opt::from_iter_safe(&["kubesocks", "-p", "70000"]).is_err());
    }

    #[test]
    fn wait_policy() {
        let policy = parse(&[]).wait_policy().unwrap();
        assert_eq!(policy.attempts, 10);
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert!(!policy.fail_on_timeout);

        let policy = parse(&["--wait-attempts", "3", "--fail-on-timeout"])
            .wait_policy()
            .unwrap();
        assert_eq!(policy.attempts, 3);
        assert!(policy.fail_on_timeout);

        assert!(parse(&["--wait-attempts", "0"]).wait_policy().is_err());

        // Only this test looks at --wait-attempts, so setting the variable
        // here doesn't race with the others.
        std::env::set_var("KUBESOCKS_WAIT_ATTEMPTS", "4");
        let policy = parse(&[]).wait_policy();
        std::env::remove_var("KUBESOCKS_WAIT_ATTEMPTS");
        assert_eq!(policy.unwrap().attempts, 4);
    }
}
