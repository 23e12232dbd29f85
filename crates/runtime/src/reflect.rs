//! Error-reflection wire format (§6, §9).
//!
//! A worker's raised error — possibly a tree via `cause`/`context`/an
//! exception group's members — is flattened into a sequence of
//! [`ErrorRecord`]s before it crosses the health channel, so the hub never
//! needs the worker's exception types. Records are appended post-order (a
//! node's children are emitted before the node itself), so the root is
//! always the last record and every `cause`/`context`/group-member field is
//! a backward index into `records`. A node reachable more than once (shared
//! `cause`, say) is emitted once and referenced by index the second time —
//! resolved by identity, per the design note in §9.

use std::collections::HashMap;
use std::sync::Arc;

/// One stack frame as the worker's language reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub filename: String,
    pub funcname: String,
    pub lineno: u32,
}

/// The input side: what a worker builds to describe a raised error. Mirrors
/// a Python exception's `__cause__`/`__context__`/`BaseExceptionGroup.exceptions`
/// closely enough to flatten without losing information the hub cares about.
pub struct RaisedError {
    pub class_name: String,
    pub message: String,
    pub traceback: Vec<Frame>,
    pub cause: Option<Arc<RaisedError>>,
    pub context: Option<Arc<RaisedError>>,
    pub group_members: Vec<Arc<RaisedError>>,
}

impl RaisedError {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        RaisedError {
            class_name: class_name.into(),
            message: message.into(),
            traceback: Vec::new(),
            cause: None,
            context: None,
            group_members: Vec::new(),
        }
    }

    pub fn with_traceback(mut self, frames: Vec<Frame>) -> Self {
        self.traceback = frames;
        self
    }

    pub fn with_cause(mut self, cause: Arc<RaisedError>) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_context(mut self, context: Arc<RaisedError>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn group_of(class_name: impl Into<String>, message: impl Into<String>, members: Vec<Arc<RaisedError>>) -> Self {
        RaisedError { group_members: members, ..RaisedError::new(class_name, message) }
    }
}

/// One flattened record. `cause`/`context`/`group_members` are indices into
/// the enclosing [`ReflectedError::records`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub message: String,
    pub class_name: String,
    pub group_members: Option<Vec<usize>>,
    pub traceback: Vec<Frame>,
    pub cause: Option<usize>,
    pub context: Option<usize>,
}

/// The wire payload: a flat, indexable reflection of an error tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedError {
    pub records: Vec<ErrorRecord>,
}

impl ReflectedError {
    /// The outermost error — always the last record.
    pub fn root(&self) -> &ErrorRecord {
        self.records.last().expect("a ReflectedError always has at least one record")
    }

    pub fn resolve(&self, idx: usize) -> &ErrorRecord {
        &self.records[idx]
    }
}

/// Flatten `root` into its wire form, memoizing by `Arc` identity so a node
/// reachable through more than one edge is emitted exactly once.
pub fn reflect(root: &Arc<RaisedError>) -> ReflectedError {
    let mut records = Vec::new();
    let mut memo: HashMap<usize, usize> = HashMap::new();
    reflect_one(root, &mut records, &mut memo);
    ReflectedError { records }
}

fn reflect_one(node: &Arc<RaisedError>, records: &mut Vec<ErrorRecord>, memo: &mut HashMap<usize, usize>) -> usize {
    let id = Arc::as_ptr(node) as usize;
    if let Some(&idx) = memo.get(&id) {
        return idx;
    }
    let cause = node.cause.as_ref().map(|c| reflect_one(c, records, memo));
    let context = node.context.as_ref().map(|c| reflect_one(c, records, memo));
    let group_indices: Vec<usize> = node
        .group_members
        .iter()
        .map(|m| reflect_one(m, records, memo))
        .collect();

    records.push(ErrorRecord {
        message: node.message.clone(),
        class_name: node.class_name.clone(),
        group_members: if group_indices.is_empty() { None } else { Some(group_indices) },
        traceback: node.traceback.clone(),
        cause,
        context,
    });
    let idx = records.len() - 1;
    memo.insert(id, idx);
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(line: u32) -> Frame {
        Frame { filename: "worker.py".into(), funcname: "handle".into(), lineno: line }
    }

    #[test]
    fn single_error_reflects_to_one_record_with_no_edges() {
        let e = Arc::new(RaisedError::new("ValueError", "bad input").with_traceback(vec![frame(10)]));
        let reflected = reflect(&e);
        assert_eq!(reflected.records.len(), 1);
        let root = reflected.root();
        assert_eq!(root.class_name, "ValueError");
        assert_eq!(root.cause, None);
        assert_eq!(root.context, None);
        assert_eq!(root.group_members, None);
    }

    #[test]
    fn cause_chain_is_indexed_and_root_is_last() {
        let cause = Arc::new(RaisedError::new("KeyError", "'missing'"));
        let outer = Arc::new(RaisedError::new("RuntimeError", "lookup failed").with_cause(Arc::clone(&cause)));
        let reflected = reflect(&outer);

        assert_eq!(reflected.records.len(), 2);
        let root = reflected.root();
        assert_eq!(root.class_name, "RuntimeError");
        let cause_idx = root.cause.expect("root has a cause");
        assert_eq!(reflected.resolve(cause_idx).class_name, "KeyError");
    }

    #[test]
    fn nested_exception_group_with_context_round_trips() {
        let not_found = Arc::new(
            RaisedError::new("FileNotFoundError", "no such file: data.csv")
                .with_traceback(vec![frame(1), frame(2), frame(3)]),
        );
        let div_zero = Arc::new(
            RaisedError::new("ZeroDivisionError", "division by zero")
                .with_traceback(vec![frame(4), frame(5), frame(6)]),
        );
        let context = Arc::new(RaisedError::new("TypeError", "unsupported operand type(s)"));
        let group = Arc::new(
            RaisedError::group_of(
                "ExceptionGroup",
                "2 sub-exceptions",
                vec![Arc::clone(&not_found), Arc::clone(&div_zero)],
            )
            .with_context(Arc::clone(&context)),
        );

        let reflected = reflect(&group);
        assert_eq!(reflected.records.len(), 4);

        let root = reflected.root();
        assert_eq!(root.class_name, "ExceptionGroup");
        let members = root.group_members.clone().expect("group has members");
        assert_eq!(members.len(), 2);

        let member_classes: Vec<&str> = members.iter().map(|&i| reflected.resolve(i).class_name.as_str()).collect();
        assert!(member_classes.contains(&"FileNotFoundError"));
        assert!(member_classes.contains(&"ZeroDivisionError"));

        let not_found_record = members
            .iter()
            .map(|&i| reflected.resolve(i))
            .find(|r| r.class_name == "FileNotFoundError")
            .unwrap();
        assert_eq!(not_found_record.traceback.len(), 3);
        assert_eq!(not_found_record.traceback[0].lineno, 1);

        let context_idx = root.context.expect("group has a context");
        assert_eq!(reflected.resolve(context_idx).class_name, "TypeError");
    }

    #[test]
    fn shared_cause_is_emitted_once_and_referenced_twice() {
        let shared = Arc::new(RaisedError::new("OSError", "disk full"));
        let a = Arc::new(RaisedError::new("First", "a").with_cause(Arc::clone(&shared)));
        let b = Arc::new(RaisedError::new("Second", "b").with_cause(Arc::clone(&shared)));
        let group = Arc::new(RaisedError::group_of("Group", "g", vec![a, b]));

        let reflected = reflect(&group);
        // shared + a + b + group == 4, not 5: the shared cause counts once.
        assert_eq!(reflected.records.len(), 4);

        let root = reflected.root();
        let members = root.group_members.clone().unwrap();
        let cause_a = reflected.resolve(members[0]).cause.unwrap();
        let cause_b = reflected.resolve(members[1]).cause.unwrap();
        assert_eq!(cause_a, cause_b);
    }
}
