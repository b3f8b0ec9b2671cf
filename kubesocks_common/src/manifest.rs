//! Tools for manipulating Kubernetes manifests.

use handlebars::Handlebars;

use crate::{prelude::*, session::ProxySession};

/// The manifest we use to create a proxy pod.
const PROXY_POD_MANIFEST: &str = include_str!("proxy_pod.yml.hbs");

/// Render the specified YAML manifest, filling in the supplied values
/// using [Handlebars][].
///
/// [Handlebars]: https://handlebarsjs.com/
pub fn render_manifest<T: Serialize>(
    template_yml: &str,
    params: &T,
) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);

    // Every string we interpolate is inside double quotes.
    handlebars.register_escape_fn(yaml_escape);

    handlebars
        .render_template(template_yml, params)
        .context("error rendering manifest template")
}

/// Render the pod manifest for `session`.
pub fn proxy_pod_manifest(session: &ProxySession) -> Result<String> {
    render_manifest(PROXY_POD_MANIFEST, session)
        .with_context(|| format!("could not build manifest for pod {}", session.pod_name))
}

/// Escape a string as a YAML value. We assume the value we're escaping is
/// quoted in the YAML.
///
/// See  http://yaml.org/spec/1.2/spec.html#id2776092 for details.
fn yaml_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            '\0' => result.push_str("\\0"),
            ' ' => result.push(' '),
            c if c.is_ascii_graphic() => result.push(c),
            c if c as u32 <= 0xFFFF => {
                result.push_str(&format!("\\u{:04x}", c as u32))
            }
            c => result.push_str(&format!("\\U{:08x}", c as u32)),
        }
    }
    result
}

#[test]
fn yaml_escape_handles_quoting_chars() {
    let examples = &[
        ("serjs/go-socks5-proxy:latest", "serjs/go-socks5-proxy:latest"),
        ("registry:5000/a b", "registry:5000/a b"),
        ("\\", "\\\\"),
        ("\"", "\\\""),
        ("\n", "\\n"),
        ("\t", "\\t"),
        ("\u{0007}", "\\u0007"),
        ("\u{1F9E6}", "\\U0001f9e6"),
    ];
    for &(input, expected) in examples {
        assert_eq!(yaml_escape(input), expected);
    }
}

#[test]
fn proxy_pod_manifest_describes_one_linux_container() {
    let mut session = ProxySession::with_defaults("kind-dev");
    session.namespace = "team-a".to_owned();
    session.pod_name = "myproxy".to_owned();
    session.pod_port = 9050;
    session.image = "example.com/socks\"5".to_owned();

    let manifest = proxy_pod_manifest(&session).unwrap();
    let pod: serde_yaml::Value = serde_yaml::from_str(&manifest).unwrap();

    assert_eq!(pod["kind"].as_str(), Some("Pod"));
    assert_eq!(pod["metadata"]["name"].as_str(), Some("myproxy"));
    assert_eq!(pod["metadata"]["namespace"].as_str(), Some("team-a"));
    assert_eq!(pod["metadata"]["labels"]["env"].as_str(), Some("test"));
    assert_eq!(
        pod["spec"]["nodeSelector"]["kubernetes.io/os"].as_str(),
        Some("linux"),
    );

    let containers = pod["spec"]["containers"].as_sequence().unwrap();
    assert_eq!(containers.len(), 1);
    let container = &containers[0];
    assert_eq!(container["name"].as_str(), Some("myproxy"));
    assert_eq!(container["image"].as_str(), Some("example.com/socks\"5"));
    assert_eq!(container["ports"][0]["containerPort"].as_u64(), Some(9050));
    assert_eq!(container["env"][0]["name"].as_str(), Some("PROXY_PORT"));
    assert_eq!(container["env"][0]["value"].as_str(), Some("9050"));
}
