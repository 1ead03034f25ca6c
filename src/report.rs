//! Bug-report archives.
//!
//! When a proof run misbehaves, a single `.tar.gz` makes it reproducible
//! elsewhere: the compiled definition, the claims input, the full RPC
//! transcript (numbered request/response pairs), the proof states, and a
//! manifest with versions and a timestamp.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tar::{Builder, Header};

use crate::proof::ReachProof;
use crate::rpc::Transcript;
use crate::utils::hash_str;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("cannot write bug report: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything that goes into one bug report.
#[derive(Default)]
pub struct BugReport<'a> {
    pub definition_dir: Option<&'a Path>,
    pub claims_file: Option<&'a Path>,
    pub transcript: Option<&'a Transcript>,
    pub proofs: Vec<&'a ReachProof>,
}

impl BugReport<'_> {
    /// Write the archive; `path` gets a `.tar.gz` suffix unless it already
    /// has one. Returns the path written.
    pub fn write(&self, path: &Path) -> Result<PathBuf, ReportError> {
        let path = if path.to_string_lossy().ends_with(".tar.gz") {
            path.to_path_buf()
        } else {
            PathBuf::from(format!("{}.tar.gz", path.display()))
        };

        let file = File::create(&path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut archive = Builder::new(encoder);

        let mut entries: Vec<String> = Vec::new();

        if let Some(dir) = self.definition_dir {
            archive.append_dir_all("definition", dir)?;
            entries.push("definition/".to_string());
        }
        if let Some(claims) = self.claims_file {
            archive.append_path_with_name(claims, "claims.json")?;
            entries.push("claims.json".to_string());
        }
        if let Some(transcript) = self.transcript {
            for (index, entry) in transcript.entries.iter().enumerate() {
                append_bytes(
                    &mut archive,
                    &format!("rpc/{:04}_request.json", index + 1),
                    entry.request.to_string().as_bytes(),
                )?;
                append_bytes(
                    &mut archive,
                    &format!("rpc/{:04}_response.json", index + 1),
                    entry.response.to_string().as_bytes(),
                )?;
            }
            entries.push(format!("rpc/ ({} exchanges)", transcript.entries.len()));
        }
        for proof in &self.proofs {
            let name = format!("proofs/{}.json", hash_str(&proof.id));
            append_bytes(&mut archive, &name, proof.to_dict().to_string().as_bytes())?;
            entries.push(name);
        }

        let manifest = json!({
            "tool": "allpath",
            "tool_version": env!("CARGO_PKG_VERSION"),
            "created_at": chrono::Utc::now().to_rfc3339(),
            "entries": entries,
        });
        append_bytes(&mut archive, "manifest.json", manifest.to_string().as_bytes())?;

        archive.into_inner()?.finish()?.flush()?;
        Ok(path)
    }
}

fn append_bytes<W: Write>(
    archive: &mut Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<(), std::io::Error> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, name, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{Atts, Claim};
    use crate::rpc::TranscriptEntry;
    use crate::term::{bool_token, Term};
    use flate2::read::GzDecoder;
    use std::collections::BTreeSet;

    #[test]
    fn archive_contains_all_parts() {
        let dir = tempfile::tempdir().unwrap();
        let claims_path = dir.path().join("claims.json");
        std::fs::write(&claims_path, "{}").unwrap();

        let claim = Claim::new(
            "spec",
            Term::apply(
                "<top>",
                vec![Term::rewrite(Term::apply("a", vec![]), Term::apply("b", vec![]))],
            ),
            bool_token(true),
            bool_token(true),
            Atts::default(),
        );
        let proof = ReachProof::from_claim(&claim).unwrap();

        let transcript = Transcript {
            entries: vec![TranscriptEntry {
                method: "execute".into(),
                request: json!({"method": "execute"}),
                response: json!({"result": {}}),
            }],
        };

        let report = BugReport {
            definition_dir: None,
            claims_file: Some(&claims_path),
            transcript: Some(&transcript),
            proofs: vec![&proof],
        };
        let out = report.write(&dir.path().join("report")).unwrap();
        assert!(out.to_string_lossy().ends_with("report.tar.gz"));

        let mut names: BTreeSet<String> = BTreeSet::new();
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&out).unwrap()));
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            names.insert(entry.path().unwrap().to_string_lossy().to_string());
        }
        assert!(names.contains("claims.json"));
        assert!(names.contains("manifest.json"));
        assert!(names.contains("rpc/0001_request.json"));
        assert!(names.contains("rpc/0001_response.json"));
        assert!(names.contains(&format!("proofs/{}.json", hash_str("spec"))));
    }
}
