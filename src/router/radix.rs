//! Radix tree implementation for HTTP route matching
//!
//! One tree is built per HTTP method. Each node represents one path segment;
//! lookup walks one node per segment, so matching cost is proportional to the
//! depth of the request path and independent of how many routes are registered.
//!
//! ## Node layout
//!
//! - Literal children are keyed by their exact segment text
//! - A node has at most one parameter child (`{name}`), which captures any
//!   non-empty segment
//! - A node that terminates a template stores the handler
//!
//! ## Precedence
//!
//! At every level the literal child is tried first. If the literal branch cannot
//! consume the rest of the path the walk backtracks into the parameter child, so
//! `/items/active` wins over `/items/{id}` while `/items/42` still reaches the
//! parameterized route.

use std::collections::HashMap;
use std::sync::Arc;

use super::core::{ParamVec, RouteError};

/// One parsed segment of a path template
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    /// Matches exactly this text (may be empty for `/` or a trailing slash)
    Literal(String),
    /// Captures the request segment under this name
    Param(Arc<str>),
}

/// Split a template such as `/items/{item_id}` into segments.
///
/// The leading `/` is required. Everything after it is split on `/` without
/// dropping empty segments, so `/items/` and `/items` stay distinct.
pub(crate) fn parse_template(template: &str) -> Result<Vec<Segment>, RouteError> {
    let invalid = |reason: &'static str| RouteError::InvalidTemplate {
        template: template.to_string(),
        reason,
    };

    let rest = template
        .strip_prefix('/')
        .ok_or_else(|| invalid("template must start with '/'"))?;

    let mut segments = Vec::new();
    let mut seen: Vec<&str> = Vec::new();
    for raw in rest.split('/') {
        if let Some(inner) = raw.strip_prefix('{') {
            let name = inner
                .strip_suffix('}')
                .ok_or_else(|| invalid("unterminated parameter placeholder"))?;
            if name.is_empty() {
                return Err(invalid("empty parameter name"));
            }
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid("parameter names may only contain [A-Za-z0-9_]"));
            }
            if seen.contains(&name) {
                return Err(invalid("parameter name used twice in one template"));
            }
            seen.push(name);
            segments.push(Segment::Param(Arc::from(name)));
        } else if raw.contains('{') || raw.contains('}') {
            return Err(invalid("a parameter must occupy a whole segment"));
        } else {
            segments.push(Segment::Literal(raw.to_string()));
        }
    }
    Ok(segments)
}

/// Split a request path into the segments the tree is keyed by.
#[inline]
pub(crate) fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.strip_prefix('/').unwrap_or(path).split('/')
}

/// Node in the radix tree
#[derive(Debug, Clone)]
struct RadixNode<H> {
    /// Literal children keyed by segment text
    children: HashMap<String, RadixNode<H>>,
    /// The single parameter child, if any
    param_child: Option<Box<RadixNode<H>>>,
    /// Parameter name when this node is itself a parameter node
    param_name: Option<Arc<str>>,
    /// Handler stored when a template ends at this node
    handler: Option<H>,
}

impl<H> RadixNode<H> {
    fn new(param_name: Option<Arc<str>>) -> Self {
        Self {
            children: HashMap::new(),
            param_child: None,
            param_name,
            handler: None,
        }
    }

    fn search<'a>(&'a self, segments: &[&str], params: &mut ParamVec) -> Option<&'a H> {
        let Some((segment, remaining)) = segments.split_first() else {
            return self.handler.as_ref();
        };

        if let Some(child) = self.children.get(*segment) {
            if let Some(found) = child.search(remaining, params) {
                return Some(found);
            }
        }

        if segment.is_empty() {
            return None;
        }

        let param_child = self.param_child.as_deref()?;
        let name = param_child.param_name.as_ref()?;
        params.push((Arc::clone(name), (*segment).to_string()));
        if let Some(found) = param_child.search(remaining, params) {
            return Some(found);
        }
        // Backtrack: the capture belongs to a branch that did not match
        params.pop();
        None
    }
}

/// A prefix tree holding every route registered for one HTTP method
#[derive(Debug, Clone)]
pub(crate) struct RadixTree<H> {
    root: RadixNode<H>,
    len: usize,
}

impl<H> Default for RadixTree<H> {
    fn default() -> Self {
        Self {
            root: RadixNode::new(None),
            len: 0,
        }
    }
}

impl<H> RadixTree<H> {
    /// Insert `handler` at the node addressed by `segments`.
    ///
    /// Fails when the template already has a handler, or when a parameter at
    /// some position is named differently from the one already stored there.
    pub(crate) fn insert(
        &mut self,
        method: &http::Method,
        template: &str,
        segments: &[Segment],
        handler: H,
    ) -> Result<(), RouteError> {
        let mut node = &mut self.root;
        for segment in segments {
            node = match segment {
                Segment::Literal(text) => node
                    .children
                    .entry(text.clone())
                    .or_insert_with(|| RadixNode::new(None)),
                Segment::Param(name) => {
                    if let Some(existing) = node.param_child.as_ref().and_then(|c| c.param_name.as_ref()) {
                        if existing != name {
                            return Err(RouteError::ConflictingParameter {
                                method: method.clone(),
                                template: template.to_string(),
                                existing: existing.to_string(),
                                found: name.to_string(),
                            });
                        }
                    }
                    &mut **node
                        .param_child
                        .get_or_insert_with(|| Box::new(RadixNode::new(Some(Arc::clone(name)))))
                }
            };
        }

        if node.handler.is_some() {
            return Err(RouteError::Duplicate {
                method: method.clone(),
                template: template.to_string(),
            });
        }
        node.handler = Some(handler);
        self.len += 1;
        Ok(())
    }

    /// Find the handler for `segments`, pushing captured parameters into `params`.
    ///
    /// `params` is left untouched when nothing matches.
    pub(crate) fn lookup<'a>(&'a self, segments: &[&str], params: &mut ParamVec) -> Option<&'a H> {
        self.root.search(segments, params)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}
