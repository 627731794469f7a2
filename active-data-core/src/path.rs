//! Path access into nested containers.
//!
//! Paths are dotted or bracketed (`a.b[0].c`, `rows["x"]`). Quotes are
//! ignored and brackets are read as separators, so `a[0]` and `a.0` name the
//! same element.
//!
//! Reads and writes go through [`Observable`](crate::Observable) when the
//! root is one, so they are tracked like any other property access.

use std::rc::Rc;

use crate::value::{Key, Value};

/// Read the value at `path`. Missing, `null` or primitive intermediates
/// yield `Undefined`. An empty path yields `root`.
pub fn get(root: &Value, path: &str) -> Value {
    if root.is_nullish() {
        return Value::Undefined;
    }
    let segments = segments(path);
    let Some((last, parents)) = segments.split_last() else {
        return root.clone();
    };

    let mut current = root.clone();
    for segment in parents {
        current = read(&current, segment);
        if !current.is_container() {
            return Value::Undefined;
        }
    }
    read(&current, last)
}

/// Write `value` at `path`, replacing missing or primitive intermediates
/// with new objects. Returns false if `root` is not a container or the path
/// is empty.
pub fn set(root: &Value, path: &str, value: impl Into<Value>) -> bool {
    let segments = segments(path);
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };
    if !root.is_container() {
        return false;
    }

    let mut current = root.clone();
    for segment in parents {
        let mut next = read(&current, segment);
        if !next.is_container() {
            write(&current, segment, Value::object());
            next = read(&current, segment);
        }
        current = next;
    }
    write(&current, last, value.into())
}

/// A get/set pair bound to one path of one root, for form-style bindings.
#[derive(Clone, Debug)]
pub struct PathBinding {
    root: Value,
    path: Rc<str>,
}

impl PathBinding {
    pub fn get(&self) -> Value {
        get(&self.root, &self.path)
    }

    pub fn set(&self, value: impl Into<Value>) -> bool {
        set(&self.root, &self.path, value)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

pub fn bind(root: &Value, path: &str) -> PathBinding {
    PathBinding {
        root: root.clone(),
        path: Rc::from(path),
    }
}

/// Like [`bind`], first writing `init(root)` to the path.
pub fn bind_with<F>(root: &Value, path: &str, init: F) -> PathBinding
where
    F: FnOnce(&Value) -> Value,
{
    let binding = bind(root, path);
    binding.set(init(root));
    binding
}

fn segments(path: &str) -> Vec<Key> {
    let normalized: String = path
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | ']'))
        .map(|c| if c == '[' { '.' } else { c })
        .collect();
    if normalized.is_empty() {
        return Vec::new();
    }
    normalized.split('.').map(Key::from).collect()
}

fn read(container: &Value, key: &Key) -> Value {
    match container {
        Value::Observable(observable) => observable.get(key),
        Value::Data(source) => source.get(key),
        _ => Value::Undefined,
    }
}

fn write(container: &Value, key: &Key, value: Value) -> bool {
    match container {
        Value::Observable(observable) => {
            observable.set(key, value);
            true
        }
        Value::Data(source) => source.insert(key, value),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{Manager, OptionsPatch};

    #[test]
    fn parses_dots_and_brackets() {
        let keys: Vec<String> = segments(r#"a.b[0]["c"]"#).iter().map(Key::to_string).collect();
        assert_eq!(keys, ["a", "b", "0", "c"]);
        assert!(segments("").is_empty());
    }

    #[test]
    fn get_through_plain_data() {
        let root = Value::from(json!({"a": {"list": [{"name": "x"}]}, "n": null}));

        assert_eq!(get(&root, "a.list[0].name"), Value::from("x"));
        assert!(get(&root, "a.missing.name").is_undefined());
        assert!(get(&root, "n.name").is_undefined());
        assert!(get(&Value::Null, "a").is_undefined());
        assert_eq!(get(&root, ""), root);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let root = Value::object();
        assert!(set(&root, "a.b.c", 1));
        assert_eq!(root.to_json(), json!({"a": {"b": {"c": 1.0}}}));

        assert!(set(&root, "a.b", "flat"));
        assert!(set(&root, "a.b.d", true));
        assert_eq!(get(&root, "a.b.d"), Value::from(true));

        assert!(!set(&Value::from(3), "a", 1));
    }

    #[test]
    fn observable_paths_are_tracked() {
        let manager = Manager::with_options(OptionsPatch::new().immediate_reaction(true));
        let model = manager.observable(json!({"user": {"name": "ada"}}));
        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));

        manager.reaction({
            let model = model.clone();
            let seen = seen.clone();
            move || seen.borrow_mut().push(get(&model, "user.name").to_string())
        });

        let name = bind(&model, "user.name");
        name.set("grace");
        assert_eq!(*seen.borrow(), ["ada", "grace"]);
        assert_eq!(name.get(), Value::from("grace"));
    }

    #[test]
    fn bind_with_initializes() {
        let root = Value::object();
        let binding = bind_with(&root, "form.count", |_| Value::from(0));
        assert_eq!(binding.get(), Value::from(0));
        assert_eq!(binding.path(), "form.count");
    }
}
