use std::fmt;

/// Position of the pipeline in its fixed forward sequence.
///
/// Each forward variant names the state reached once its step succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Pending,
    WorkspaceCreated,
    OuterImageAttached,
    OuterImageMounted,
    OuterImageCopied,
    OuterImageReleased,
    ArchiveAttached,
    ArchiveChecked,
    ArchiveMounted,
    SecondaryImageStaged,
    SecondaryImageAttached,
    SecondaryImageMounted,
    FilesMerged,
    SecondaryImageReleased,
    SecondaryImageRecompressed,
    ArchiveReleased,
    ImageRepacked,
    Done,
    Failed,
}

impl Stage {
    /// The sixteen steps, in execution order.
    pub const FORWARD: [Stage; 16] = [
        Stage::WorkspaceCreated,
        Stage::OuterImageAttached,
        Stage::OuterImageMounted,
        Stage::OuterImageCopied,
        Stage::OuterImageReleased,
        Stage::ArchiveAttached,
        Stage::ArchiveChecked,
        Stage::ArchiveMounted,
        Stage::SecondaryImageStaged,
        Stage::SecondaryImageAttached,
        Stage::SecondaryImageMounted,
        Stage::FilesMerged,
        Stage::SecondaryImageReleased,
        Stage::SecondaryImageRecompressed,
        Stage::ArchiveReleased,
        Stage::ImageRepacked,
    ];

    /// Stage that follows this one on success; `None` once terminal.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Pending => Some(Stage::WorkspaceCreated),
            Stage::ImageRepacked => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
            forward => Stage::FORWARD
                .iter()
                .position(|s| *s == forward)
                .map(|i| Stage::FORWARD[i + 1]),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::WorkspaceCreated => "workspace-created",
            Stage::OuterImageAttached => "outer-image-attached",
            Stage::OuterImageMounted => "outer-image-mounted",
            Stage::OuterImageCopied => "outer-image-copied",
            Stage::OuterImageReleased => "outer-image-released",
            Stage::ArchiveAttached => "archive-attached",
            Stage::ArchiveChecked => "archive-checked",
            Stage::ArchiveMounted => "archive-mounted",
            Stage::SecondaryImageStaged => "secondary-image-staged",
            Stage::SecondaryImageAttached => "secondary-image-attached",
            Stage::SecondaryImageMounted => "secondary-image-mounted",
            Stage::FilesMerged => "files-merged",
            Stage::SecondaryImageReleased => "secondary-image-released",
            Stage::SecondaryImageRecompressed => "secondary-image-recompressed",
            Stage::ArchiveReleased => "archive-released",
            Stage::ImageRepacked => "image-repacked",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
