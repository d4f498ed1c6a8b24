//! Resource and tag filters of PUSH rules, compiled once per index rebuild

use regex::Regex;

use crate::classpath::Classpath;
use crate::models::{Filter, FilterFunc};

#[derive(Debug, Clone)]
pub struct CompiledFilter {
    key: Option<String>,
    func: FilterFunc,
    params: Vec<String>,
    regexes: Vec<Regex>,
}

impl CompiledFilter {
    /// Compile regex parameters up front; an invalid pattern fails the rule
    pub fn compile(filter: &Filter) -> Result<Self, String> {
        let regexes = match filter.func {
            FilterFunc::MatchRegexp | FilterFunc::NotMatchRegexp => filter
                .params
                .iter()
                .map(|p| Regex::new(p).map_err(|e| format!("bad regexp {:?}: {}", p, e)))
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };

        Ok(Self {
            key: filter.key.clone(),
            func: filter.func,
            params: filter.params.clone(),
            regexes,
        })
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Evaluate against an ident or a tag value
    pub fn matches(&self, value: &str, classpath: &dyn Classpath) -> bool {
        let params = &self.params;
        match self.func {
            FilterFunc::InList => params.iter().any(|p| p == value),
            FilterFunc::NotInList => !params.iter().any(|p| p == value),
            FilterFunc::HasPrefix => params.iter().any(|p| value.starts_with(p.as_str())),
            FilterFunc::NoPrefix => !params.iter().any(|p| value.starts_with(p.as_str())),
            FilterFunc::HasSuffix => params.iter().any(|p| value.ends_with(p.as_str())),
            FilterFunc::NoSuffix => !params.iter().any(|p| value.ends_with(p.as_str())),
            FilterFunc::Contains => params.iter().any(|p| value.contains(p.as_str())),
            FilterFunc::NotContains => !params.iter().any(|p| value.contains(p.as_str())),
            FilterFunc::MatchRegexp => self.regexes.iter().any(|r| r.is_match(value)),
            FilterFunc::NotMatchRegexp => !self.regexes.iter().any(|r| r.is_match(value)),
            FilterFunc::InClasspath => params.iter().any(|p| classpath.exists(value, p)),
            FilterFunc::NotInClasspath => !params.iter().any(|p| classpath.exists(value, p)),
            FilterFunc::InClasspathPrefix => self.under_prefix(value, classpath),
            FilterFunc::NotInClasspathPrefix => !self.under_prefix(value, classpath),
        }
    }

    /// Some classpath of `ident` starts with one of the params.
    /// An ident outside every classpath is under no prefix.
    fn under_prefix(&self, ident: &str, classpath: &dyn Classpath) -> bool {
        classpath
            .get_values(ident)
            .iter()
            .any(|path| self.params.iter().any(|p| path.starts_with(p.as_str())))
    }
}
