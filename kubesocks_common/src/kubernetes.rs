//! Tools for talking to Kubernetes.
//!
//! Everything goes through the `kubectl` binary, so we pick up the user's
//! kubeconfig, credentials plugins and contexts for free.

use std::{
    io,
    process::{Command, Stdio},
    thread::sleep,
};

use crate::{interrupt, prelude::*};

/// How often we check on a running `kubectl port-forward`.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);

/// The status of a pod, as far as we care.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PodStatus {
    /// The pod phase, e.g. `Pending` or `Running`.
    pub phase: String,
}

impl PodStatus {
    /// Is the pod up and running?
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }
}

/// Why did a port-forward stop?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ForwardEnd {
    /// `kubectl` exited successfully on its own.
    Normal,
    /// We were interrupted by the user.
    Interrupted,
}

/// The operations we need from a Kubernetes cluster.
pub trait Cluster {
    /// Look up a pod. Returns `None` if it doesn't exist.
    fn get_pod(
        &self,
        name: &str,
        namespace: &str,
        context: &str,
    ) -> Result<Option<PodStatus>>;

    /// Apply a YAML manifest.
    fn apply(&self, manifest: &str, namespace: &str, context: &str) -> Result<()>;

    /// Delete a pod.
    fn delete_pod(&self, name: &str, namespace: &str, context: &str) -> Result<()>;

    /// Forward `local_port` to `pod_port` on the pod. Blocks until the tunnel
    /// closes.
    fn port_forward(
        &self,
        name: &str,
        namespace: &str,
        context: &str,
        local_port: u16,
        pod_port: u16,
    ) -> Result<ForwardEnd>;
}

/// A [`Cluster`] reached by running `kubectl`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Kubectl;

impl Cluster for Kubectl {
    fn get_pod(
        &self,
        name: &str,
        namespace: &str,
        context: &str,
    ) -> Result<Option<PodStatus>> {
        let args = scoped_args(
            &["get", "pod", name, "--ignore-not-found", "-o", "json"],
            namespace,
            context,
        );
        let stdout = kubectl_output(&args)?;
        parse_pod_status(&stdout)
            .with_context(|| format!("error parsing output of kubectl {:?}", args))
    }

    fn apply(&self, manifest: &str, namespace: &str, context: &str) -> Result<()> {
        kubectl_with_input(&scoped_args(&["apply", "-f", "-"], namespace, context), manifest)
    }

    fn delete_pod(&self, name: &str, namespace: &str, context: &str) -> Result<()> {
        kubectl(&scoped_args(&["delete", "pod", name], namespace, context))
    }

    fn port_forward(
        &self,
        name: &str,
        namespace: &str,
        context: &str,
        local_port: u16,
        pod_port: u16,
    ) -> Result<ForwardEnd> {
        let target = format!("pod/{}", name);
        let ports = format!("{}:{}", local_port, pod_port);
        let args = scoped_args(&["port-forward", target.as_str(), ports.as_str()], namespace, context);
        let mut command = Command::new("kubectl");
        command.args(&args);
        supervise(&mut command, interrupt::interrupted)
    }
}

/// Run `command` until it exits or `interrupted` returns true, in which case
/// we kill it. We poll instead of blocking in `wait`, so that a `SIGTERM`
/// sent only to us still shuts down the child.
fn supervise<F>(command: &mut Command, interrupted: F) -> Result<ForwardEnd>
where
    F: Fn() -> bool,
{
    debug!("running {:?}", command);
    let mut child = command
        .spawn()
        .with_context(|| format!("error starting {:?}", command))?;

    loop {
        let exited = child
            .try_wait()
            .with_context(|| format!("error running {:?}", command))?;
        if let Some(status) = exited {
            if interrupted() {
                return Ok(ForwardEnd::Interrupted);
            } else if status.success() {
                return Ok(ForwardEnd::Normal);
            }
            return Err(format_err!("error running {:?}: {}", command, status));
        }

        if interrupted() {
            debug!("interrupted, stopping {:?}", command);
            // Fails harmlessly if the same Ctrl-C already stopped it.
            if let Err(err) = child.kill() {
                trace!("could not kill child: {}", err);
            }
            child
                .wait()
                .with_context(|| format!("error waiting for {:?}", command))?;
            return Ok(ForwardEnd::Interrupted);
        }
        sleep(SUPERVISE_INTERVAL);
    }
}

/// Append `-n` and `--context` to a `kubectl` command line.
fn scoped_args<'a>(args: &[&'a str], namespace: &'a str, context: &'a str) -> Vec<&'a str> {
    let mut scoped = args.to_vec();
    scoped.extend_from_slice(&["-n", namespace, "--context", context]);
    scoped
}

/// Parse the output of `kubectl get pod --ignore-not-found -o json`. This
/// is empty when there's no such pod, although some `kubectl` versions print
/// an empty `List` instead.
fn parse_pod_status(stdout: &[u8]) -> Result<Option<PodStatus>> {
    /// A Kubernetes pod or list of pods (missing lots of fields).
    #[derive(Debug, Deserialize)]
    struct Object {
        #[serde(default)]
        kind: String,
        #[serde(default)]
        items: Vec<Object>,
        #[serde(default)]
        status: Status,
    }

    #[derive(Debug, Default, Deserialize)]
    struct Status {
        phase: Option<String>,
    }

    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let mut object: Object = serde_json::from_slice(stdout)?;
    if object.kind == "List" {
        match object.items.len() {
            0 => return Ok(None),
            1 => object = object.items.remove(0),
            n => return Err(format_err!("expected at most 1 pod, found {}", n)),
        }
    }
    Ok(Some(PodStatus {
        phase: object.status.phase.unwrap_or_else(|| "Unknown".to_owned()),
    }))
}

/// Run `kubectl`, passing any output through to the console.
pub fn kubectl(args: &[&str]) -> Result<()> {
    debug!("running kubectl {:?}", args);
    let status = Command::new("kubectl")
        .args(args)
        .status()
        .with_context(|| format!("error starting kubectl with {:?}", args))?;
    if !status.success() {
        return Err(format_err!("error running kubectl with {:?}", args));
    }
    Ok(())
}

/// Run `kubectl` and capture its standard output.
pub fn kubectl_output(args: &[&str]) -> Result<Vec<u8>> {
    debug!("running kubectl {:?}", args);
    let output = Command::new("kubectl")
        .args(args)
        // Pass `stderr` through on console instead of capturing.
        .stderr(Stdio::inherit())
        .output()
        .with_context(|| format!("error starting kubectl with {:?}", args))?;
    if !output.status.success() {
        return Err(format_err!("error running kubectl with {:?}", args));
    }
    Ok(output.stdout)
}

/// Run `kubectl` with the specified input.
pub fn kubectl_with_input(args: &[&str], input: &str) -> Result<()> {
    debug!("running kubectl {:?}", args);
    let mut child = Command::new("kubectl")
        .args(args)
        .stdin(Stdio::piped())
        .spawn()
        .with_context(|| format!("error starting kubectl with {:?}", args))?;
    {
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| format_err!("kubectl stdin is missing"))?;
        write!(stdin, "{}", input)
            .with_context(|| format!("error writing input to kubectl {:?}", args))?;
    }
    // Close stdin so `kubectl` sees the end of the manifest.
    drop(child.stdin.take());
    let status = child
        .wait()
        .with_context(|| format!("error running kubectl with {:?}", args))?;
    if !status.success() {
        return Err(format_err!("error running kubectl with {:?}", args));
    }
    Ok(())
}

/// Make sure we can run `kubectl` at all, before touching any cluster.
pub fn ensure_kubectl_installed() -> Result<()> {
    let result = Command::new("kubectl")
        .args(&["version", "--client"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match result {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(format_err!("`kubectl version --client` failed: {}", status)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(format_err!(
            "could not find `kubectl`; please install it and make sure it is in your PATH"
        )),
        Err(err) => Err(err).context("error starting kubectl"),
    }
}

/// Get the name of the user's current `kubectl` context.
pub fn current_context() -> Result<String> {
    let stdout = kubectl_output(&["config", "current-context"])
        .context("could not determine the current Kubernetes context")?;
    let context = String::from_utf8(stdout)
        .context("current Kubernetes context is not valid UTF-8")?
        .trim()
        .to_owned();
    if context.is_empty() {
        return Err(format_err!("no current Kubernetes context is set"));
    }
    Ok(context)
}
