//! Repository header repair for module fragments.
//!
//! Build tools publish fragments without the `<repository>` root the descriptor
//! toolkit expects. A missing root is synthesized around the original lines:
//!
//! ```text
//! 0  <?xml ...?>                         0  <?xml ...?>
//! 1  <?artifactRepository ...?>          1  <?artifactRepository ...?>
//! 2  <artifacts size='1'>          =>    2  <repository name="temporary" ...>
//!    ...                                 3  <properties size="1">...</properties>
//!                                        4  <artifacts size='1'>
//!                                           ...
//!                                           </repository>
//! ```
//!
//! Metadata fragments additionally get the `<?metadataRepository?>` instruction at
//! line 1 when it is missing.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::AggregatorError;
use crate::model::DescriptorKind;

pub const TEMPORARY_REPOSITORY_NAME: &str = "temporary";
const REPOSITORY_OPEN: &str = "<repository";
const REPOSITORY_CLOSE: &str = "</repository>";
const METADATA_INSTRUCTION: &str = "<?metadataRepository";

/// Index of the line that must hold the repository root element.
const ROOT_LINE: usize = 2;

/// Result of preparing a fragment for the toolkit.
#[derive(Debug, Clone)]
pub struct PreparedFragment {
    pub path: PathBuf,
    pub repaired: bool,
}

fn minimum_lines(kind: DescriptorKind) -> usize {
    match kind {
        DescriptorKind::Artifacts => ROOT_LINE + 1,
        DescriptorKind::Metadata => 2,
    }
}

/// Splits fragment text into lines, dropping trailing blank lines.
pub fn split_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    lines
}

/// Whether the fragment already declares its repository root at the expected line.
pub fn has_repository_header(
    kind: DescriptorKind,
    lines: &[String],
) -> Result<bool, AggregatorError> {
    let required = minimum_lines(kind);
    if lines.len() < required {
        return Err(AggregatorError::MalformedFragment {
            kind,
            reason: format!(
                "fragment has {} line(s), header check needs at least {required}",
                lines.len()
            ),
        });
    }
    let root_declared = |index: usize| {
        lines
            .get(index)
            .is_some_and(|line| line.contains(REPOSITORY_OPEN))
    };
    Ok(match kind {
        DescriptorKind::Artifacts => root_declared(ROOT_LINE),
        DescriptorKind::Metadata => {
            lines[1].contains(METADATA_INSTRUCTION) && root_declared(ROOT_LINE)
        }
    })
}

/// Inserts the synthesized root declaration, properties block and closing element.
pub fn repair_lines(kind: DescriptorKind, mut lines: Vec<String>, timestamp_millis: i64) -> Vec<String> {
    if kind == DescriptorKind::Metadata
        && !lines.get(1).is_some_and(|line| line.contains(METADATA_INSTRUCTION))
    {
        lines.insert(1, kind.processing_instruction().to_string());
    }
    let at = ROOT_LINE.min(lines.len());
    lines.insert(
        at,
        format!(
            "<repository name=\"{TEMPORARY_REPOSITORY_NAME}\" type=\"{}\" version=\"1\">",
            kind.repository_type()
        ),
    );
    lines.insert(
        at + 1,
        format!(
            "<properties size=\"1\"><property name=\"p2.timestamp\" value=\"{timestamp_millis}\"/> </properties>"
        ),
    );
    lines.push(REPOSITORY_CLOSE.to_string());
    lines
}

/// Writes the fragment into `fragment_dir` under the descriptor file name the
/// toolkit expects, repairing its header first when needed.
pub fn prepare_fragment(
    kind: DescriptorKind,
    raw: &[u8],
    fragment_dir: &Path,
) -> Result<PreparedFragment, AggregatorError> {
    let text = std::str::from_utf8(raw).map_err(|err| AggregatorError::MalformedFragment {
        kind,
        reason: format!("fragment is not valid utf-8: {err}"),
    })?;
    let lines = split_lines(text);
    let path = fragment_dir.join(kind.file_name());

    if has_repository_header(kind, &lines)? {
        fs::write(&path, raw).map_err(AggregatorError::Staging)?;
        return Ok(PreparedFragment {
            path,
            repaired: false,
        });
    }

    let timestamp = chrono::Utc::now().timestamp_millis();
    let repaired = repair_lines(kind, lines, timestamp);
    debug!(
        kind = %kind,
        lines = repaired.len(),
        timestamp,
        "synthesized repository header for fragment"
    );

    let mut body = repaired.join("\n");
    body.push('\n');
    fs::write(&path, body).map_err(AggregatorError::Staging)?;
    Ok(PreparedFragment {
        path,
        repaired: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|line| line.to_string()).collect()
    }

    const TYCHO_ARTIFACTS: &[&str] = &[
        "<?xml version='1.0' encoding='UTF-8'?>",
        "<?artifactRepository version='1.1.0'?>",
        "<artifacts size='1'>",
        "  <artifact classifier='osgi.bundle' id='X' version='1.0.0'/>",
        "</artifacts>",
    ];

    const TYCHO_CONTENT: &[&str] = &[
        "<?xml version='1.0' encoding='UTF-8'?>",
        "<units size='1'>",
        "  <unit id='X' version='1.0.0'/>",
        "</units>",
    ];

    #[test]
    fn detects_missing_artifacts_header() {
        assert!(!has_repository_header(DescriptorKind::Artifacts, &lines(TYCHO_ARTIFACTS)).unwrap());

        let repaired = repair_lines(DescriptorKind::Artifacts, lines(TYCHO_ARTIFACTS), 7);
        assert!(has_repository_header(DescriptorKind::Artifacts, &repaired).unwrap());
        assert_eq!(
            repaired[2],
            "<repository name=\"temporary\" type=\"org.eclipse.equinox.p2.artifact.repository.simpleRepository\" version=\"1\">"
        );
        assert!(repaired[3].contains("value=\"7\""));
        assert_eq!(repaired[4], "<artifacts size='1'>");
        assert_eq!(repaired.last().unwrap(), "</repository>");
        assert_eq!(repaired.len(), TYCHO_ARTIFACTS.len() + 3);
    }

    #[test]
    fn metadata_repair_adds_instruction_and_root() {
        let repaired = repair_lines(DescriptorKind::Metadata, lines(TYCHO_CONTENT), 9);
        assert_eq!(repaired[1], "<?metadataRepository version='1.1.0'?>");
        assert!(repaired[2].starts_with("<repository name=\"temporary\""));
        assert!(repaired[2].contains("LocalMetadataRepository"));
        assert_eq!(repaired[4], "<units size='1'>");
        assert!(has_repository_header(DescriptorKind::Metadata, &repaired).unwrap());
    }

    #[test]
    fn metadata_with_instruction_only_gets_root() {
        let mut raw = lines(TYCHO_CONTENT);
        raw.insert(1, "<?metadataRepository version='1.1.0'?>".to_string());
        assert!(!has_repository_header(DescriptorKind::Metadata, &raw).unwrap());

        let repaired = repair_lines(DescriptorKind::Metadata, raw.clone(), 1);
        assert_eq!(repaired.len(), raw.len() + 3);
        assert_eq!(
            repaired
                .iter()
                .filter(|line| line.contains(METADATA_INSTRUCTION))
                .count(),
            1
        );
    }

    #[test]
    fn short_fragments_are_malformed() {
        let err = has_repository_header(DescriptorKind::Artifacts, &lines(&["<?xml?>", "<a/>"]))
            .unwrap_err();
        assert!(matches!(err, AggregatorError::MalformedFragment { .. }));
        assert!(has_repository_header(DescriptorKind::Metadata, &lines(&["<?xml?>"])).is_err());
    }

    #[test]
    fn well_formed_fragment_is_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let raw = "<?xml version='1.0'?>\n<?artifactRepository version='1.1.0'?>\n<repository name='x'>\n</repository>\n";
        let prepared = prepare_fragment(DescriptorKind::Artifacts, raw.as_bytes(), dir.path()).unwrap();
        assert!(!prepared.repaired);
        assert_eq!(prepared.path, dir.path().join("artifacts.xml"));
        assert_eq!(fs::read_to_string(&prepared.path).unwrap(), raw);
    }

    #[test]
    fn trailing_blank_lines_are_ignored() {
        assert_eq!(split_lines("a\r\nb\n\n  \n"), vec!["a", "b"]);
    }

    proptest! {
        #[test]
        fn repair_places_root_and_single_close(
            body in proptest::collection::vec("[a-z ]{0,12}", 1..8),
            timestamp in 0i64..i64::MAX,
        ) {
            let mut raw = lines(&TYCHO_ARTIFACTS[..2]);
            raw.extend(body.iter().map(|line| format!("<e>{line}</e>")));
            prop_assume!(!has_repository_header(DescriptorKind::Artifacts, &raw).unwrap());

            let repaired = repair_lines(DescriptorKind::Artifacts, raw.clone(), timestamp);
            prop_assert!(repaired[2].starts_with("<repository name=\"temporary\""));
            prop_assert_eq!(repaired.iter().filter(|l| l.as_str() == "</repository>").count(), 1);
            prop_assert_eq!(repaired.last().map(String::as_str), Some("</repository>"));
            prop_assert_eq!(&repaired[4..repaired.len() - 1], &raw[2..]);
        }
    }
}
