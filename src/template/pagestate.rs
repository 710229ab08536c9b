//! The render buffer of one request: output sink, named sections,
//! and the page properties set by the template.

use std::collections::HashMap;

use kstring::KString;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("output limit of {limit} bytes exceeded")]
pub struct OutputLimitExceeded {
    pub limit: usize,
}

/// Where `Write` currently goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterPos {
    Direct,
    Sectioned(KString),
}

fn append(buf: &mut Vec<u8>, bytes: &[u8], limit: usize) -> Result<(), OutputLimitExceeded> {
    if buf.len().saturating_add(bytes.len()) > limit {
        return Err(OutputLimitExceeded { limit })
    }
    buf.extend_from_slice(bytes);
    Ok(())
}

#[derive(Debug)]
pub struct PageState {
    pub title: Option<String>,
    pub layout: Option<String>,
    /// Set by the page; `None` leaves the processor's default.
    pub status: Option<u16>,
    pub mime: Option<String>,
    pub headers: Vec<(String, String)>,
    sink: Vec<u8>,
    current: WriterPos,
    sections: HashMap<KString, Vec<u8>>,
    /// Byte ceiling for the sink and for each section.
    limit: usize,
}

impl PageState {
    pub fn new(limit: usize) -> Self {
        PageState {
            title: None,
            layout: None,
            status: None,
            mime: None,
            headers: Vec::new(),
            sink: Vec::new(),
            current: WriterPos::Direct,
            sections: HashMap::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn current_writer(&self) -> &WriterPos {
        &self.current
    }

    /// Append to whatever the current writer targets. A write that
    /// would pass the limit is refused as a whole.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), OutputLimitExceeded> {
        let limit = self.limit;
        match &self.current {
            WriterPos::Direct => append(&mut self.sink, bytes, limit),
            WriterPos::Sectioned(name) => {
                let buf = self.sections.entry(name.clone()).or_default();
                append(buf, bytes, limit)
            }
        }
    }

    /// `Some(name)`: start capturing into a fresh buffer for `name`
    /// (replacing earlier contents). `None`: back to direct output.
    pub fn section(&mut self, name: Option<&str>) {
        match name {
            Some(name) => {
                let name = KString::from_ref(name);
                self.sections.insert(name.clone(), Vec::new());
                self.current = WriterPos::Sectioned(name);
            }
            None => self.current = WriterPos::Direct,
        }
    }

    /// Copy the contents of section `name`, if it exists, to the
    /// current writer. The section keeps its contents.
    pub fn write_section(&mut self, name: &str) -> Result<(), OutputLimitExceeded> {
        if let Some(contents) = self.sections.get(name) {
            // may be the current writer's own buffer
            let contents = contents.clone();
            self.write(&contents)
        } else {
            Ok(())
        }
    }

    /// Back to direct output; sections are kept.
    pub fn clear(&mut self) {
        self.current = WriterPos::Direct;
    }

    pub fn section_contents(&self, name: &str) -> Option<&[u8]> {
        self.sections.get(name).map(|v| &v[..])
    }

    pub fn output(&self) -> &[u8] {
        &self.sink
    }

    pub fn into_output(self) -> Vec<u8> {
        self.sink
    }
}
