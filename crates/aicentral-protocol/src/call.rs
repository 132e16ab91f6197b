/// The operation a client asked the gateway to perform, independent of which
/// vendor path shape (Azure or OpenAI) carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Chat,
    Completions,
    Embeddings,
    ImageGeneration,
    Transcription,
    Translation,
    Other,
}

impl CallKind {
    /// Trailing path segments shared by both vendor shapes.
    pub fn path_suffix(self) -> &'static str {
        match self {
            CallKind::Chat => "chat/completions",
            CallKind::Completions => "completions",
            CallKind::Embeddings => "embeddings",
            CallKind::ImageGeneration => "images/generations",
            CallKind::Transcription => "audio/transcriptions",
            CallKind::Translation => "audio/translations",
            CallKind::Other => "",
        }
    }

    pub fn from_path_suffix(suffix: &str) -> Self {
        match suffix {
            "chat/completions" => CallKind::Chat,
            "completions" => CallKind::Completions,
            "embeddings" => CallKind::Embeddings,
            "images/generations" => CallKind::ImageGeneration,
            "audio/transcriptions" => CallKind::Transcription,
            "audio/translations" => CallKind::Translation,
            _ => CallKind::Other,
        }
    }

    /// Whether a deployment/model name must resolve before dispatch.
    pub fn requires_model(self) -> bool {
        !matches!(self, CallKind::Other)
    }

    /// Audio endpoints carry multipart form bodies instead of JSON.
    pub fn is_multipart(self) -> bool {
        matches!(self, CallKind::Transcription | CallKind::Translation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Chat => "chat",
            CallKind::Completions => "completions",
            CallKind::Embeddings => "embeddings",
            CallKind::ImageGeneration => "image_generation",
            CallKind::Transcription => "transcription",
            CallKind::Translation => "translation",
            CallKind::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_suffix_round_trips() {
        for kind in [
            CallKind::Chat,
            CallKind::Completions,
            CallKind::Embeddings,
            CallKind::ImageGeneration,
            CallKind::Transcription,
            CallKind::Translation,
        ] {
            assert_eq!(CallKind::from_path_suffix(kind.path_suffix()), kind);
        }
        assert_eq!(CallKind::from_path_suffix("fine_tunes"), CallKind::Other);
    }
}
