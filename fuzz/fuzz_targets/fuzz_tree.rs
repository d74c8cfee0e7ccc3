#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use persistree::{BTree, Error, FileStorage, FileStorageOptions};
use std::{collections::BTreeMap, ops::Bound, path::Path, rc::Rc};

#[macro_use]
extern crate log;

#[derive(Debug, Clone, Default)]
struct Failure(Option<(&'static str, Rc<str>)>);

impl<'a> Arbitrary<'a> for Failure {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        if cfg!(not(feature = "failpoints")) {
            return Ok(Failure::default());
        }
        const FAILPOINTS: &[&str] = &["fsync", "fread", "fwrite"];

        let a = u.arbitrary::<u8>()?;
        let b = u.arbitrary::<u8>()?;
        let c = a ^ b;
        let config = format!("{0}*off->{1}*return({0}-{1})->off", a % 10, b % 5);
        Ok(Failure(Some((
            FAILPOINTS[c as usize % FAILPOINTS.len()],
            config.into(),
        ))))
    }

    fn size_hint(depth: usize) -> (usize, Option<usize>) {
        <u8 as Arbitrary>::size_hint(depth)
    }
}

impl Failure {
    fn call<T>(&self, fun: impl FnOnce() -> T) -> T {
        if cfg!(not(feature = "failpoints")) {
            return fun();
        }
        if let Some((name, config)) = &self.0 {
            trace!("Setting up failpoint {} {}", name, config);
            fail::cfg(*name, config).unwrap();
            let result = fun();
            fail::cfg(*name, "off").unwrap();
            result
        } else {
            fun()
        }
    }
}

type Key = u16;
type Value = Vec<u8>;
type Tree = BTree<Key, Value, FileStorage<Key, Value>>;
type Model = BTreeMap<Key, Value>;

#[derive(Debug, Arbitrary)]
enum Op {
    Insert(Key, Value, Failure),
    Remove(Key, Failure),
    ClearRange(Bound<Key>, Bound<Key>, Failure),
    Clear(Failure),
    Compact(Failure),
    Scan(Key, Key),
    Reopen,
}

#[derive(Debug, Arbitrary)]
struct Input {
    max_node_size: u8,
    use_checksums: bool,
    ops: Vec<Op>,
}

fn open(path: &Path, input: &Input) -> Tree {
    let mut options = FileStorageOptions::new(path);
    options.max_node_size = 2 + input.max_node_size as usize % 15;
    options.use_checksums = input.use_checksums;
    options.disable_fsync = cfg!(not(feature = "failpoints"));
    BTree::open(FileStorage::open(options).unwrap()).unwrap()
}

fn validate(tree: &Tree, model: &Model) {
    let stats = tree.verify().unwrap();
    assert_eq!(stats.entries, model.len() as u64);
    let mut entries = Vec::new();
    tree.copy_entries_into(&mut entries).unwrap();
    let expected: Vec<(Key, Value)> = model.iter().map(|(k, v)| (*k, v.clone())).collect();
    assert_eq!(entries, expected);
}

fn in_bounds(key: &Key, start: Bound<&Key>, end: Bound<&Key>) -> bool {
    let above = match start {
        Bound::Included(s) => key >= s,
        Bound::Excluded(s) => key > s,
        Bound::Unbounded => true,
    };
    let below = match end {
        Bound::Included(e) => key <= e,
        Bound::Excluded(e) => key < e,
        Bound::Unbounded => true,
    };
    above && below
}

fuzz_target!(|input: Input| {
    let _ = env_logger::try_init();
    let folder = tempfile::tempdir().unwrap();
    let mut tree = open(folder.path(), &input);
    let mut model = Model::new();
    for op in &input.ops {
        debug!("{op:?}");
        let mut failed = false;
        match op {
            Op::Insert(k, v, failure) => match failure.call(|| tree.insert(*k, v.clone())) {
                Ok(previous) => assert_eq!(previous, model.insert(*k, v.clone())),
                Err(e) => {
                    error!("insert failed: {e}");
                    failed = true;
                }
            },
            Op::Remove(k, failure) => match failure.call(|| tree.remove(k)) {
                Ok(removed) => assert_eq!(removed, model.remove(k)),
                Err(e) => {
                    error!("remove failed: {e}");
                    failed = true;
                }
            },
            Op::ClearRange(start, end, failure) => {
                let (start, end) = (start.as_ref(), end.as_ref());
                match failure.call(|| tree.clear_range((start, end))) {
                    Ok(cleared) => {
                        let before = model.len();
                        model.retain(|k, _| !in_bounds(k, start, end));
                        assert_eq!(cleared, (before - model.len()) as u64);
                    }
                    Err(Error::IllegalArgument(_)) => (),
                    Err(e) => {
                        error!("clear_range failed: {e}");
                        failed = true;
                    }
                }
            }
            Op::Clear(failure) => match failure.call(|| tree.clear()) {
                Ok(()) => model.clear(),
                Err(e) => {
                    error!("clear failed: {e}");
                    failed = true;
                }
            },
            Op::Compact(failure) => {
                if let Err(e) = failure.call(|| tree.storage().compact()) {
                    error!("compact failed: {e}");
                    failed = true;
                }
            }
            Op::Scan(a, b) => {
                let view = tree.view();
                if let Ok(sub) = view.sub_map(*a, *b) {
                    let keys: Vec<Key> = sub.keys().collect::<Result<_, _>>().unwrap();
                    assert!(keys.iter().eq(model.range(*a..*b).map(|(k, _)| k)));
                }
            }
            Op::Reopen => {
                drop(tree);
                tree = open(folder.path(), &input);
                failed = true;
            }
        }
        if failed {
            validate(&tree, &model);
        }
    }
    validate(&tree, &model);
    drop(tree);
    validate(&open(folder.path(), &input), &model);
});
