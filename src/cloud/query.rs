use std::fmt;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone, PartialEq)]
enum Term {
    NameEq(String),
    InParents(String),
    MimeEq(String),
    MimeNe(String),
    NotTrashed,
}

/// Conjunction of Drive search predicates. Values are quoted and escaped
/// when rendered, so names can contain quotes or backslashes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    terms: Vec<Term>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_eq(mut self, name: &str) -> Self {
        self.terms.push(Term::NameEq(name.to_string()));
        self
    }

    pub fn in_parents(mut self, parent_id: &str) -> Self {
        self.terms.push(Term::InParents(parent_id.to_string()));
        self
    }

    pub fn mime_eq(mut self, mime: &str) -> Self {
        self.terms.push(Term::MimeEq(mime.to_string()));
        self
    }

    pub fn mime_ne(mut self, mime: &str) -> Self {
        self.terms.push(Term::MimeNe(mime.to_string()));
        self
    }

    pub fn not_trashed(mut self) -> Self {
        self.terms.push(Term::NotTrashed);
        self
    }

    /// Live folders with this name, optionally under `parent_id`.
    pub fn folder(name: &str, parent_id: Option<&str>) -> Self {
        let query = Self::new().name_eq(name).mime_eq(FOLDER_MIME);
        match parent_id {
            Some(parent) => query.in_parents(parent),
            None => query,
        }
        .not_trashed()
    }

    /// Live file with this name directly under `parent_id`.
    pub fn file(name: &str, parent_id: &str) -> Self {
        Self::new().name_eq(name).in_parents(parent_id).not_trashed()
    }
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(" and ")?;
            }
            match term {
                Term::NameEq(name) => write!(f, "name={}", quote(name))?,
                Term::InParents(id) => write!(f, "{} in parents", quote(id))?,
                Term::MimeEq(mime) => write!(f, "mimeType={}", quote(mime))?,
                Term::MimeNe(mime) => write!(f, "mimeType!={}", quote(mime))?,
                Term::NotTrashed => f.write_str("trashed=false")?,
            }
        }
        Ok(())
    }
}
