use base64::{Engine as _, engine::general_purpose::STANDARD};
use regex::Regex;
use std::sync::LazyLock;

pub const PLOT_MARKER_PREFIX: &str = "[PLOT_B64:";

/// Prepended to plotting programs. Forces a headless backend and turns every
/// `show()` into one marker line carrying the current figure as PNG.
const PLOT_SHIM: &str = r#"import matplotlib as __sbx_mpl
__sbx_mpl.use("Agg")
import matplotlib.pyplot as __sbx_plt


def __sbx_show(*args, **kwargs):
    import base64
    import io

    buffer = io.BytesIO()
    __sbx_plt.gcf().savefig(buffer, format="png", bbox_inches="tight")
    encoded = base64.b64encode(buffer.getvalue()).decode("ascii")
    print("[PLOT_B64:" + encoded + "]", flush=True)
    __sbx_plt.close("all")


__sbx_plt.show = __sbx_show
"#;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    let prefix = regex::escape(PLOT_MARKER_PREFIX);
    Regex::new(&format!(r"{prefix}([A-Za-z0-9+/=]*)\]\n?")).expect("static marker pattern")
});

pub fn with_plot_shim(code: &str) -> String {
    format!("{PLOT_SHIM}\n{code}")
}

/// Splits marker lines out of program output.
///
/// Returns the cleaned stdout and one `data:` URI per well-formed marker, in
/// output order. Markers with an undecodable payload are stripped and dropped.
pub fn extract_plots(stdout: &str) -> (String, Vec<String>) {
    let mut plots = Vec::new();
    for captures in MARKER.captures_iter(stdout) {
        let payload = &captures[1];
        match STANDARD.decode(payload) {
            Ok(bytes) if !bytes.is_empty() => {
                plots.push(format!("data:image/png;base64,{payload}"));
            }
            _ => tracing::warn!(len = payload.len(), "Dropping malformed plot marker"),
        }
    }

    let cleaned = MARKER.replace_all(stdout, "").into_owned();
    (cleaned, plots)
}
