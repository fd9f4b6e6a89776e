/// Longest joined `fields` value sent before falling back to `*`.
pub const URL_MAX_FIELDS: usize = 8 * 1024;

/// Composes REST query strings.
///
/// ```rust
/// use stormon_api::rest::HrefBuilder;
///
/// let href = HrefBuilder::new()
///     .api_path("storage/volumes")
///     .fields(&["svm.name", "name"])
///     .max_records(500)
///     .build();
/// assert_eq!(href, "api/storage/volumes?return_records=true&fields=name,svm.name&max_records=500");
/// ```
#[derive(Debug, Clone, Default)]
pub struct HrefBuilder {
    api_path: String,
    fields: Vec<String>,
    hidden_fields: Vec<String>,
    counter_schemas: Vec<String>,
    filter: Vec<String>,
    query_fields: String,
    query_value: String,
    max_records: Option<usize>,
    return_timeout: Option<u32>,
    ignore_unknown_fields: bool,
}

impl HrefBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_path(mut self, path: &str) -> Self {
        self.api_path = path.trim_start_matches('/').to_string();
        self
    }

    pub fn fields<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.fields = fields.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    /// Fields that `*` does not return and must always be listed.
    pub fn hidden_fields<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.hidden_fields = fields.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    pub fn counter_schemas<S: AsRef<str>>(mut self, schemas: &[S]) -> Self {
        self.counter_schemas = schemas.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    /// Filters in `key=value` form.
    pub fn filter<S: AsRef<str>>(mut self, filter: &[S]) -> Self {
        self.filter = filter.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    pub fn query_fields(mut self, fields: &str) -> Self {
        self.query_fields = fields.to_string();
        self
    }

    pub fn query_value(mut self, value: &str) -> Self {
        self.query_value = value.to_string();
        self
    }

    pub fn max_records(mut self, n: usize) -> Self {
        self.max_records = Some(n);
        self
    }

    pub fn return_timeout(mut self, seconds: u32) -> Self {
        self.return_timeout = Some(seconds);
        self
    }

    pub fn ignore_unknown_fields(mut self, enabled: bool) -> Self {
        self.ignore_unknown_fields = enabled;
        self
    }

    fn joined_fields(&self) -> String {
        let mut fields: Vec<&str> = self.fields.iter().map(String::as_str).collect();
        fields.sort_unstable();
        fields.dedup();
        let mut joined = fields.join(",");
        if joined.len() > URL_MAX_FIELDS {
            joined = "*".to_string();
        }
        let mut hidden: Vec<&str> = self
            .hidden_fields
            .iter()
            .map(String::as_str)
            .filter(|h| !fields.contains(h))
            .collect();
        hidden.sort_unstable();
        for h in hidden {
            if !joined.is_empty() {
                joined.push(',');
            }
            joined.push_str(h);
        }
        joined
    }

    pub fn build(&self) -> String {
        let mut href = String::new();
        if !self.api_path.starts_with("api/") {
            href.push_str("api/");
        }
        href.push_str(&self.api_path);
        href.push_str("?return_records=true");
        add_arg(&mut href, "&fields=", &self.joined_fields());
        add_arg(&mut href, "&counter_schemas=", &self.counter_schemas.join(","));
        for f in &self.filter {
            add_arg(&mut href, "&", f);
        }
        add_arg(&mut href, "&query_fields=", &self.query_fields);
        add_arg(&mut href, "&query=", &self.query_value);
        if let Some(n) = self.max_records {
            add_arg(&mut href, "&max_records=", &n.to_string());
        }
        if let Some(t) = self.return_timeout {
            add_arg(&mut href, "&return_timeout=", &t.to_string());
        }
        if self.ignore_unknown_fields && !self.api_path.contains("api/private") && !self.api_path.starts_with("private") {
            add_arg(&mut href, "&ignore_unknown_fields=", "true");
        }
        href
    }
}

fn add_arg(href: &mut String, key: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    href.push_str(key);
    href.push_str(value);
}
