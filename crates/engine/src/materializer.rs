//! Document materializer – persists calculation output.
//!
//! Documents are assembled either by an external authoring service or, when
//! none is configured, by filling a text template. Raw artifacts (variable
//! XML, RTF, PDF) are written through [`FilesystemOps`]. Failures here are
//! local `Io`/`Fault` errors and never touch an already computed result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::traits::{
    AuthoringApp, AuthoringService, DocumentFormat, DocumentHandle, DocumentSpec, EngineError,
    EngineResult, FilesystemOps,
};
use crate::types::{CalculationResult, RenderedOutput};

pub const DEFAULT_TEMPLATE: &str = "\
{{name}}
Library: {{library}}
Item: {{item}}

Variables:
{{variables}}

Output:
{{rendered_text}}
";

/// Replace `{{placeholder}}`s in a single pass. Unknown placeholders stay
/// literal and substituted values are never rescanned.
pub fn fill_template(template: &str, spec: &DocumentSpec) -> String {
    let mut out = String::with_capacity(template.len() + spec.rendered_text.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let value = match after[..end].trim() {
            "name" => Some(spec.name.as_str()),
            "library" => Some(spec.library_ref.as_str()),
            "item" => Some(spec.item_ref.as_str()),
            "variables" => Some(spec.variables_xml.as_str()),
            "rendered_text" => Some(spec.rendered_text.as_str()),
            _ => None,
        };
        match value {
            Some(v) => out.push_str(v),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Owns an authoring app and the documents added to it.
///
/// On drop, documents are closed (only when the app is not visible to the
/// user) newest first, then the app handle is released.
struct AuthoringScope {
    app: Box<dyn AuthoringApp>,
    documents: Vec<DocumentHandle>,
}

impl AuthoringScope {
    fn open(service: &dyn AuthoringService) -> EngineResult<Self> {
        Ok(Self {
            app: service.open()?,
            documents: Vec::new(),
        })
    }

    fn add(&mut self, spec: &DocumentSpec) -> EngineResult<DocumentHandle> {
        let handle = self.app.add_document(spec)?;
        self.documents.push(handle);
        Ok(handle)
    }
}

impl Drop for AuthoringScope {
    fn drop(&mut self) {
        let close_documents = !self.app.is_visible();
        while let Some(doc) = self.documents.pop() {
            if close_documents {
                if let Err(e) = self.app.close_document(doc) {
                    tracing::warn!(document = doc.0, error = %e, "closing document failed");
                }
            }
        }
        if let Err(e) = self.app.release() {
            tracing::warn!(error = %e, "authoring service release failed");
        }
    }
}

pub struct DocumentMaterializer {
    fs: Arc<dyn FilesystemOps>,
    authoring: Option<Arc<dyn AuthoringService>>,
    template: Option<String>,
}

impl DocumentMaterializer {
    pub fn new(fs: Arc<dyn FilesystemOps>) -> Self {
        Self {
            fs,
            authoring: None,
            template: None,
        }
    }

    pub fn with_authoring(mut self, service: Arc<dyn AuthoringService>) -> Self {
        self.authoring = Some(service);
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn uses_authoring(&self) -> bool {
        self.authoring.is_some()
    }

    /// Assemble and persist one document in `format` at `path`.
    pub fn save_document(
        &self,
        format: DocumentFormat,
        spec: &DocumentSpec,
        path: &Path,
    ) -> EngineResult<()> {
        match &self.authoring {
            Some(service) => {
                let mut scope = AuthoringScope::open(service.as_ref())?;
                let doc = scope.add(spec)?;
                scope.app.save_as(doc, path, format)?;
                tracing::info!(path = %path.display(), ?format, "document saved via authoring service");
                Ok(())
            }
            None => {
                if format == DocumentFormat::Pdf {
                    return Err(EngineError::InvalidRequest(
                        "template documents are text only; PDF needs an authoring service".into(),
                    ));
                }
                let template = self.template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
                self.fs
                    .write_file(path, fill_template(template, spec).as_bytes())?;
                tracing::info!(path = %path.display(), "document saved from template");
                Ok(())
            }
        }
    }

    pub fn save_variables(&self, path: &Path, variables_xml: &str) -> EngineResult<()> {
        self.fs.write_file(path, variables_xml.as_bytes())
    }

    pub fn save_rendered(&self, path: &Path, output: &RenderedOutput) -> EngineResult<()> {
        match output {
            RenderedOutput::Text(text) => self.fs.write_file(path, text.as_bytes()),
            RenderedOutput::Binary(bytes) => self.fs.write_file(path, bytes),
        }
    }

    /// Write every populated field of `result` as `<stem>.xml`, `<stem>.rtf`
    /// and `<stem>.pdf` under `dir`. Returns the paths written.
    pub fn save_result(
        &self,
        dir: &Path,
        stem: &str,
        result: &CalculationResult,
    ) -> EngineResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        if let Some(xml) = &result.output_variables {
            let path = dir.join(format!("{}.xml", stem));
            self.save_variables(&path, xml)?;
            written.push(path);
        }
        if let Some(text) = &result.rendered_text {
            let path = dir.join(format!("{}.rtf", stem));
            self.fs.write_file(&path, text.as_bytes())?;
            written.push(path);
        }
        if let Some(bytes) = &result.rendered_binary {
            let path = dir.join(format!("{}.pdf", stem));
            self.fs.write_file(&path, bytes)?;
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryFilesystem, RecordingAuthoring};
    use crate::types::CalcStatus;

    fn spec() -> DocumentSpec {
        DocumentSpec {
            name: "Beam check".into(),
            library_ref: r"$(SysLbrDir)\Lib.ted".into(),
            item_ref: "Beam;Design".into(),
            variables_xml: "<variables/>".into(),
            rendered_text: r"{\rtf1 output}".into(),
        }
    }

    #[test]
    fn test_fill_template_single_pass() {
        let mut s = spec();
        s.rendered_text = "{{name}}".into();
        let out = fill_template("[{{name}}] {{ item }} {{unknown}} {{rendered_text}} {{tail", &s);
        assert_eq!(out, "[Beam check] Beam;Design {{unknown}} {{name}} {{tail");
    }

    #[test]
    fn test_default_template_carries_all_inputs() {
        let fs = Arc::new(MemoryFilesystem::new());
        let m = DocumentMaterializer::new(fs.clone());
        let path = Path::new("/out/beam.txt");
        m.save_document(DocumentFormat::Native, &spec(), path).unwrap();
        let text = String::from_utf8(fs.contents(path).unwrap()).unwrap();
        for needle in ["Beam check", "$(SysLbrDir)\\Lib.ted", "Beam;Design", "<variables/>", r"{\rtf1 output}"] {
            assert!(text.contains(needle), "missing {}", needle);
        }
    }

    #[test]
    fn test_template_pdf_rejected() {
        let fs = Arc::new(MemoryFilesystem::new());
        let m = DocumentMaterializer::new(fs.clone()).with_template("{{name}}");
        let err = m
            .save_document(DocumentFormat::Pdf, &spec(), Path::new("/out/beam.pdf"))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        assert!(!fs.exists(Path::new("/out/beam.pdf")));
    }

    #[test]
    fn test_authoring_hidden_closes_then_releases() {
        let service = Arc::new(RecordingAuthoring::new());
        let m = DocumentMaterializer::new(Arc::new(MemoryFilesystem::new()))
            .with_authoring(service.clone());
        m.save_document(DocumentFormat::Pdf, &spec(), Path::new("/out/beam.pdf"))
            .unwrap();
        assert_eq!(
            service.journal().entries(),
            vec![
                "authoring.open".to_string(),
                r"authoring.add Beam check $(SysLbrDir)\Lib.ted Beam;Design".to_string(),
                "authoring.save#1 Pdf /out/beam.pdf".to_string(),
                "authoring.close#1".to_string(),
                "authoring.release".to_string(),
            ]
        );
        assert_eq!(service.live_handles(), 0);
    }

    #[test]
    fn test_authoring_visible_leaves_document_open() {
        let service = Arc::new(RecordingAuthoring::new().visible(true));
        let m = DocumentMaterializer::new(Arc::new(MemoryFilesystem::new()))
            .with_authoring(service.clone());
        m.save_document(DocumentFormat::Native, &spec(), Path::new("/out/beam.ted"))
            .unwrap();
        assert!(!service.journal().contains_prefix("authoring.close"));
        assert_eq!(service.journal().count("authoring.release"), 1);
    }

    #[test]
    fn test_authoring_released_when_save_fails() {
        let service = Arc::new(RecordingAuthoring::new().failing_on("save_as"));
        let m = DocumentMaterializer::new(Arc::new(MemoryFilesystem::new()))
            .with_authoring(service.clone());
        assert!(m
            .save_document(DocumentFormat::Native, &spec(), Path::new("/out/beam.ted"))
            .is_err());
        assert_eq!(service.journal().count("authoring.close#1"), 1);
        assert_eq!(service.live_handles(), 0);
    }

    #[test]
    fn test_authoring_released_when_add_fails() {
        let service = Arc::new(RecordingAuthoring::new().failing_on("add_document"));
        let m = DocumentMaterializer::new(Arc::new(MemoryFilesystem::new()))
            .with_authoring(service.clone());
        assert!(m
            .save_document(DocumentFormat::Native, &spec(), Path::new("/out/beam.ted"))
            .is_err());
        assert!(!service.journal().contains_prefix("authoring.close"));
        assert_eq!(service.live_handles(), 0);
    }

    #[test]
    fn test_save_result_writes_present_fields_only() {
        let fs = Arc::new(MemoryFilesystem::new());
        let m = DocumentMaterializer::new(fs.clone());
        let mut result = CalculationResult::empty(CalcStatus::Ok);
        result.output_variables = Some("<variables/>".into());
        result.rendered_binary = Some(b"%PDF".to_vec());

        let written = m.save_result(Path::new("/out"), "beam", &result).unwrap();
        assert_eq!(
            written,
            vec![PathBuf::from("/out/beam.xml"), PathBuf::from("/out/beam.pdf")]
        );
        assert_eq!(fs.contents(Path::new("/out/beam.pdf")).unwrap(), b"%PDF");
    }

    #[test]
    fn test_io_failure_stays_local() {
        let m = DocumentMaterializer::new(Arc::new(MemoryFilesystem::read_only()));
        let mut result = CalculationResult::empty(CalcStatus::Ok);
        result.output_variables = Some("<variables/>".into());
        let err = m.save_result(Path::new("/out"), "beam", &result).unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert_eq!(result.output_variables.as_deref(), Some("<variables/>"));
    }
}
