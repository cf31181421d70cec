use regex::Regex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    None,
    Plotting,
    InteractiveGraphics,
}

/// Decides which capture strategy a submission needs.
pub trait ArtifactClassifier: std::fmt::Debug + Send + Sync {
    fn classify(&self, code: &str) -> ArtifactKind;
}

/// Looks for top-level `import x` / `from x import ...` statements.
#[derive(Debug)]
pub struct ImportClassifier {
    plotting: Regex,
    interactive: Regex,
}

impl ImportClassifier {
    pub fn new(plotting: &[&str], interactive: &[&str]) -> Result<Self, regex::Error> {
        Ok(Self {
            plotting: import_pattern(plotting)?,
            interactive: import_pattern(interactive)?,
        })
    }
}

impl Default for ImportClassifier {
    fn default() -> Self {
        Self {
            plotting: import_pattern(&["matplotlib", "seaborn"])
                .expect("static plotting pattern"),
            interactive: import_pattern(&["pygame"]).expect("static interactive pattern"),
        }
    }
}

fn import_pattern(modules: &[&str]) -> Result<Regex, regex::Error> {
    let names = modules
        .iter()
        .map(|m| regex::escape(m))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r"(?m)^\s*(?:import\s+(?:[\w.]+(?:\s+as\s+\w+)?\s*,\s*)*|from\s+)(?:{names})\b"
    ))
}

impl ArtifactClassifier for ImportClassifier {
    fn classify(&self, code: &str) -> ArtifactKind {
        if self.interactive.is_match(code) {
            ArtifactKind::InteractiveGraphics
        } else if self.plotting.is_match(code) {
            ArtifactKind::Plotting
        } else {
            ArtifactKind::None
        }
    }
}
