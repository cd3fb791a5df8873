use super::{
    file_filter, request, ChangesetContext, Job, JobKey, JobSettings, SyntaxHighlightFile,
};
use crate::error::JobFailure;
use crate::runner::Transport;
use crate::storage::{Database, HighlightLink, Side, UnlinkedVersion};
use crate::worker::{
    DetectLanguagesRequest, DetectedLanguage, Language, VersionToDetect, DETECT_FILE_LANGUAGES,
};
use anyhow::Result;
use std::collections::{BTreeMap, HashSet};

/// Detects the language of file versions from their contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectFileLanguages {
    pub context: ChangesetContext,
    pub file: i64,
    /// Set when the job covers one side after a split
    pub side: Option<Side>,
    pub versions: Vec<VersionToDetect>,
}

impl DetectFileLanguages {
    pub fn key(&self) -> JobKey {
        let item = match self.side {
            Some(side) => format!("{}/{}", self.file, side),
            None => self.file.to_string(),
        };
        JobKey {
            class: "DetectFileLanguages",
            group: self.context.changeset.to_string(),
            item,
        }
    }

    pub fn split(&self) -> Vec<Self> {
        if self.versions.len() < 2 {
            return Vec::new();
        }
        self.versions
            .iter()
            .map(|version| Self {
                context: self.context.clone(),
                file: self.file,
                side: Some(version.side),
                versions: vec![version.clone()],
            })
            .collect()
    }

    pub async fn execute(
        self,
        transport: &dyn Transport,
    ) -> Result<Vec<DetectedLanguage>, JobFailure> {
        let payload = DetectLanguagesRequest {
            repository_path: self.context.repository_path.clone(),
            versions: self.versions,
        };
        request(transport, DETECT_FILE_LANGUAGES, &payload).await
    }

    pub fn update_database(&self, db: &Database, detected: &[DetectedLanguage]) -> Result<()> {
        let mut links = Vec::new();
        for version in detected {
            if let Some(label) = &version.language {
                links.push(link_for(
                    db,
                    &self.context,
                    version.file,
                    version.side,
                    &version.sha1,
                    label,
                )?);
            }
        }
        db.link_highlight_files(self.context.changeset, &links)
    }

    pub fn follow_ups(&self, db: &Database, settings: &JobSettings) -> Result<Vec<Job>> {
        SyntaxHighlightFile::pending(db, &self.context, settings)
    }
}

fn link_for(
    db: &Database,
    context: &ChangesetContext,
    file: i64,
    side: Side,
    sha1: &str,
    label: &str,
) -> Result<HighlightLink> {
    let language = db.language_id(label)?;
    let highlight_file =
        db.find_or_insert_highlight_file(context.repository, sha1, language, false)?;
    Ok(HighlightLink {
        file,
        side,
        highlight_file: highlight_file.id,
    })
}

/// Link every unlinked version whose language follows from its path and
/// return the versions that need their contents inspected
pub fn link_path_languages(
    db: &Database,
    context: &ChangesetContext,
) -> Result<Vec<UnlinkedVersion>> {
    let mut links = Vec::new();
    let mut remaining = Vec::new();
    for version in db.unlinked_versions(context.changeset)? {
        match Language::from_path(&version.path) {
            Some(language) => links.push(link_for(
                db,
                context,
                version.file,
                version.side,
                &version.sha1,
                language.label(),
            )?),
            None => remaining.push(version),
        }
    }
    if !links.is_empty() {
        db.link_highlight_files(context.changeset, &links)?;
    }
    Ok(remaining)
}

impl DetectFileLanguages {
    /// One detection job per file whose versions have no language yet
    pub fn pending(
        db: &Database,
        context: &ChangesetContext,
        only: Option<&HashSet<i64>>,
    ) -> Result<Vec<Job>> {
        let mut by_file: BTreeMap<i64, Vec<VersionToDetect>> = BTreeMap::new();
        for version in link_path_languages(db, context)? {
            if !file_filter(only, version.file) {
                continue;
            }
            by_file.entry(version.file).or_default().push(VersionToDetect {
                file: version.file,
                side: version.side,
                sha1: version.sha1,
                path: version.path,
            });
        }
        Ok(by_file
            .into_iter()
            .map(|(file, versions)| {
                Job::DetectLanguages(DetectFileLanguages {
                    context: context.clone(),
                    file,
                    side: None,
                    versions,
                })
            })
            .collect())
    }
}
