//! In-memory zfs hosts that understand the commands zbackup sends.
//!
//! A source and target made by [`FakeHost::pair`] share a wire: piping
//! `zfs send` on one stages a stream that `zfs recv` on the other consumes.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use zbackup_transport::{CmdItem, CmdLine, CmdPipe, ExecuteError, Input, RunOptions, RunOutput, Runner};

#[derive(Debug, Clone)]
pub struct Snap {
    pub suffix: String,
    pub guid: u64,
    pub txg: u64,
    pub written: u64,
}

#[derive(Debug, Default)]
pub struct Dataset {
    /// Locally set value of the selection property
    pub selection: Option<String>,
    pub snapshots: Vec<Snap>,
    pub bookmarks: Vec<Snap>,
    /// `(suffix, tag)`
    pub holds: Vec<(String, String)>,
    /// Bytes written since the newest snapshot
    pub dirty: u64,
    pub resume_token: Option<String>,
}

#[derive(Debug, Default)]
pub struct World {
    pub datasets: BTreeMap<String, Dataset>,
    pub txg: u64,
    /// Commands that ran
    pub commands: Vec<String>,
    /// Commands skipped in readonly mode
    pub skipped: Vec<String>,
    /// Probe flags that fail with a usage error
    pub unsupported: Vec<String>,
}

#[derive(Debug, Clone)]
struct Stream {
    suffix: String,
    guid: u64,
    base_guid: Option<u64>,
}

#[derive(Debug, Default)]
struct Wire {
    stream: Mutex<Option<Stream>>,
    next_guid: AtomicU64,
}

#[derive(Clone)]
pub struct FakeHost {
    label: String,
    readonly: bool,
    world: Arc<Mutex<World>>,
    wire: Arc<Wire>,
}

fn split(name: &str) -> (&str, Option<(char, &str)>) {
    if let Some((dataset, suffix)) = name.split_once('@') {
        (dataset, Some(('@', suffix)))
    } else if let Some((dataset, suffix)) = name.split_once('#') {
        (dataset, Some(('#', suffix)))
    } else {
        (name, None)
    }
}

fn ok(lines: Vec<String>) -> (i32, Vec<String>) {
    (0, lines)
}

fn fail() -> (i32, Vec<String>) {
    (1, Vec::new())
}

impl FakeHost {
    /// Source and target sharing one wire
    pub fn pair(readonly: bool) -> (Self, Self) {
        let wire = Arc::new(Wire {
            stream: Mutex::new(None),
            next_guid: AtomicU64::new(1000),
        });
        let host = |label: &str| Self {
            label: label.to_string(),
            readonly,
            world: Arc::new(Mutex::new(World::default())),
            wire: wire.clone(),
        };
        (host("source"), host("target"))
    }

    pub fn runner(&self) -> Arc<dyn Runner> {
        Arc::new(self.clone())
    }

    pub fn with_world<T>(&self, f: impl FnOnce(&mut World) -> T) -> T {
        f(&mut self.world.lock().unwrap())
    }

    fn next_guid(&self) -> u64 {
        self.wire.next_guid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add_dataset(&self, name: &str) {
        self.with_world(|w| {
            w.datasets.entry(name.to_string()).or_default();
        });
    }

    pub fn select(&self, name: &str, value: &str) {
        self.with_world(|w| w.datasets.entry(name.to_string()).or_default().selection = Some(value.to_string()));
    }

    pub fn write(&self, name: &str, bytes: u64) {
        self.with_world(|w| w.datasets.get_mut(name).unwrap().dirty += bytes);
    }

    /// Take a snapshot behind zbackup's back
    pub fn manual_snapshot(&self, name: &str, suffix: &str, written: u64) {
        let guid = self.next_guid();
        self.with_world(|w| {
            w.txg += 1;
            let txg = w.txg;
            w.datasets.get_mut(name).unwrap().snapshots.push(Snap {
                suffix: suffix.to_string(),
                guid,
                txg,
                written,
            });
        });
    }

    pub fn set_resume_token(&self, name: &str, token: &str) {
        self.with_world(|w| w.datasets.get_mut(name).unwrap().resume_token = Some(token.to_string()));
    }

    pub fn exists(&self, name: &str) -> bool {
        self.with_world(|w| w.datasets.contains_key(name))
    }

    pub fn snapshots(&self, name: &str) -> Vec<String> {
        self.with_world(|w| {
            w.datasets
                .get(name)
                .map(|d| d.snapshots.iter().map(|s| s.suffix.clone()).collect())
                .unwrap_or_default()
        })
    }

    pub fn bookmarks(&self, name: &str) -> Vec<String> {
        self.with_world(|w| {
            w.datasets
                .get(name)
                .map(|d| d.bookmarks.iter().map(|s| s.suffix.clone()).collect())
                .unwrap_or_default()
        })
    }

    pub fn holds(&self, name: &str, suffix: &str) -> Vec<String> {
        self.with_world(|w| {
            w.datasets
                .get(name)
                .map(|d| {
                    d.holds
                        .iter()
                        .filter(|(s, _)| s == suffix)
                        .map(|(_, tag)| tag.clone())
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    pub fn commands(&self) -> Vec<String> {
        self.with_world(|w| w.commands.clone())
    }

    pub fn skipped(&self) -> Vec<String> {
        self.with_world(|w| w.skipped.clone())
    }

    /// Stage the stream a `zfs send` would produce
    fn prepare_send(&self, argv: &[String]) -> Option<Stream> {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        if args.get(..2) != Some(&["zfs", "send"][..]) {
            return None;
        }
        let world = self.world.lock().unwrap();
        let guid_of = |name: &str| -> Option<u64> {
            let (dataset, pit) = split(name);
            let (sep, suffix) = pit?;
            let dataset = world.datasets.get(dataset)?;
            let list = if sep == '@' { &dataset.snapshots } else { &dataset.bookmarks };
            list.iter().find(|s| s.suffix == suffix).map(|s| s.guid)
        };

        if let Some(index) = args.iter().position(|a| *a == "-t") {
            let (dataset, pit) = split(args.get(index + 1)?.strip_prefix("token:")?);
            let (_, suffix) = pit?;
            let snapshots = &world.datasets.get(dataset)?.snapshots;
            let position = snapshots.iter().position(|s| s.suffix == suffix)?;
            return Some(Stream {
                suffix: suffix.to_string(),
                guid: snapshots[position].guid,
                base_guid: position.checked_sub(1).map(|i| snapshots[i].guid),
            });
        }

        let mut base_guid = None;
        let mut iter = args.iter().skip(2);
        while let Some(arg) = iter.next() {
            if *arg == "-i" {
                base_guid = Some(guid_of(*iter.next()?)?);
            } else if arg.contains('@') {
                let (_, pit) = split(arg);
                return Some(Stream {
                    suffix: pit?.1.to_string(),
                    guid: guid_of(*arg)?,
                    base_guid,
                });
            }
        }
        None
    }

    fn execute(&self, argv: &[String], forced: bool) -> (i32, Vec<String>) {
        let start = argv
            .iter()
            .position(|a| a == "zfs" || a == "zpool")
            .unwrap_or_default();
        let args: Vec<&str> = argv[start..].iter().map(String::as_str).collect();
        let mut world = self.world.lock().unwrap();

        match args.as_slice() {
            ["zpool", "get", ..] => ok(vec![
                "feature@large_blocks\tactive".to_string(),
                "feature@embedded_data\tenabled".to_string(),
                "feature@extensible_dataset\tactive".to_string(),
                "feature@encryption\tdisabled".to_string(),
            ]),
            ["zfs", _, flag, "zbackup_option_test"] => {
                if world.unsupported.iter().any(|f| f == flag) {
                    (2, Vec::new())
                } else {
                    fail()
                }
            }
            ["zfs", "get", "-t", _, "-o", _, "-H", _property] => {
                let mut rows = Vec::new();
                for name in world.datasets.keys() {
                    let own = world.datasets[name].selection.clone();
                    let row = match own {
                        Some(value) => format!("{name}\t{value}\tlocal"),
                        None => {
                            let inherited = world
                                .datasets
                                .iter()
                                .filter(|(other, d)| name.starts_with(&format!("{other}/")) && d.selection.is_some())
                                .max_by_key(|(other, _)| other.len());
                            match inherited {
                                Some((other, d)) => format!(
                                    "{name}\t{}\tinherited from {other}",
                                    d.selection.clone().unwrap_or_default()
                                ),
                                None => format!("{name}\t-\t-"),
                            }
                        }
                    };
                    rows.push(row);
                }
                ok(rows)
            }
            ["zfs", "get", "-H", "-p", "-o", "property,value", "all", name] => match world.datasets.get(*name) {
                Some(dataset) => ok(vec![
                    "type\tfilesystem".to_string(),
                    "guid\t1".to_string(),
                    format!("written\t{}", dataset.dirty),
                    "encryption\toff".to_string(),
                    format!(
                        "receive_resume_token\t{}",
                        dataset.resume_token.clone().unwrap_or_else(|| "-".to_string())
                    ),
                ]),
                None => fail(),
            },
            ["zfs", "get", "-H", "-p", "-o", "value", property, name] if property.starts_with("written@") => {
                match world.datasets.get(*name) {
                    Some(dataset) => ok(vec![dataset.dirty.to_string()]),
                    None => fail(),
                }
            }
            ["zfs", "list", "-H", "-o", "name", name] => {
                if world.datasets.contains_key(*name) {
                    ok(vec![(*name).to_string()])
                } else {
                    fail()
                }
            }
            ["zfs", "list", "-H", "-p", "-d", "1", "-t", "snapshot,bookmark", "-o", _, "-s", "createtxg", name] => {
                let Some(dataset) = world.datasets.get(*name) else {
                    return fail();
                };
                let mut rows: Vec<(u64, String)> = dataset
                    .snapshots
                    .iter()
                    .map(|s| (s.txg, format!("{name}@{}\t{}\t{}\t{}", s.suffix, s.guid, s.txg, s.written)))
                    .collect();
                rows.extend(
                    dataset
                        .bookmarks
                        .iter()
                        .map(|b| (b.txg, format!("{name}#{}\t{}\t{}\t-", b.suffix, b.guid, b.txg))),
                );
                rows.sort_by_key(|(txg, _)| *txg);
                ok(rows.into_iter().map(|(_, row)| row).collect())
            }
            ["zfs", "list", "-H", "-o", "name", "-t", "filesystem,volume", "-r", rest @ ..] => {
                let (depth, root) = match rest {
                    ["-d", "1", root] => (Some(1), *root),
                    [root] => (None, *root),
                    _ => return (2, Vec::new()),
                };
                if !world.datasets.contains_key(root) {
                    return fail();
                }
                let prefix = format!("{root}/");
                ok(world
                    .datasets
                    .keys()
                    .filter(|name| *name == root || name.starts_with(&prefix))
                    .filter(|name| depth.is_none_or(|_| !name[root.len()..].trim_start_matches('/').contains('/')))
                    .cloned()
                    .collect())
            }
            ["zfs", "holds", "-H", name] => {
                let (dataset, pit) = split(name);
                let Some((_, suffix)) = pit else { return fail() };
                match world.datasets.get(dataset) {
                    Some(d) if d.snapshots.iter().any(|s| s.suffix == suffix) => ok(d
                        .holds
                        .iter()
                        .filter(|(s, _)| s == suffix)
                        .map(|(_, tag)| format!("{name}\t{tag}\tMon Jan  1 00:00 2024"))
                        .collect()),
                    _ => fail(),
                }
            }
            ["zfs", "snapshot", names @ ..] => {
                for name in names {
                    let (dataset, pit) = split(name);
                    let Some((_, suffix)) = pit else { return fail() };
                    let guid = self.next_guid();
                    world.txg += 1;
                    let txg = world.txg;
                    let Some(d) = world.datasets.get_mut(dataset) else {
                        return fail();
                    };
                    d.snapshots.push(Snap {
                        suffix: suffix.to_string(),
                        guid,
                        txg,
                        written: d.dirty,
                    });
                    d.dirty = 0;
                }
                ok(Vec::new())
            }
            ["zfs", "destroy", name] => {
                let (dataset, pit) = split(name);
                match pit {
                    Some(('@', suffix)) => {
                        let Some(d) = world.datasets.get_mut(dataset) else { return fail() };
                        if d.holds.iter().any(|(s, _)| s == suffix) {
                            return fail();
                        }
                        let before = d.snapshots.len();
                        d.snapshots.retain(|s| s.suffix != suffix);
                        if d.snapshots.len() == before { fail() } else { ok(Vec::new()) }
                    }
                    Some((_, suffix)) => {
                        let Some(d) = world.datasets.get_mut(dataset) else { return fail() };
                        d.bookmarks.retain(|b| b.suffix != suffix);
                        ok(Vec::new())
                    }
                    None => {
                        let prefix = format!("{dataset}/");
                        let busy = world.datasets.keys().any(|n| n.starts_with(&prefix))
                            || world.datasets.get(dataset).is_none_or(|d| !d.snapshots.is_empty());
                        if busy {
                            fail()
                        } else {
                            world.datasets.remove(dataset);
                            ok(Vec::new())
                        }
                    }
                }
            }
            ["zfs", "hold", tag, name] => {
                let (dataset, pit) = split(name);
                let Some((_, suffix)) = pit else { return fail() };
                let Some(d) = world.datasets.get_mut(dataset) else { return fail() };
                let hold = (suffix.to_string(), (*tag).to_string());
                if d.holds.contains(&hold) || !d.snapshots.iter().any(|s| s.suffix == suffix) {
                    return fail();
                }
                d.holds.push(hold);
                ok(Vec::new())
            }
            ["zfs", "release", tag, name] => {
                let (dataset, pit) = split(name);
                let Some((_, suffix)) = pit else { return fail() };
                let Some(d) = world.datasets.get_mut(dataset) else { return fail() };
                let before = d.holds.len();
                d.holds.retain(|(s, t)| !(s == suffix && t == tag));
                if d.holds.len() == before { fail() } else { ok(Vec::new()) }
            }
            ["zfs", "bookmark", snapshot, bookmark] => {
                let (dataset, pit) = split(snapshot);
                let (_, bookmark_pit) = split(bookmark);
                let (Some((_, suffix)), Some((_, bookmark_suffix))) = (pit, bookmark_pit) else {
                    return fail();
                };
                let Some(d) = world.datasets.get_mut(dataset) else { return fail() };
                let Some(snap) = d.snapshots.iter().find(|s| s.suffix == suffix).cloned() else {
                    return fail();
                };
                d.bookmarks.push(Snap {
                    suffix: bookmark_suffix.to_string(),
                    ..snap
                });
                ok(Vec::new())
            }
            ["zfs", "rollback", name] => {
                let (dataset, pit) = split(name);
                let Some((_, suffix)) = pit else { return fail() };
                let Some(d) = world.datasets.get_mut(dataset) else { return fail() };
                // more recent snapshots exist, use -r
                if d.snapshots.last().is_none_or(|s| s.suffix != suffix) {
                    return fail();
                }
                d.dirty = 0;
                ok(Vec::new())
            }
            ["zfs", "recv", "-A", name] => {
                let Some(d) = world.datasets.get_mut(*name) else { return fail() };
                d.resume_token = None;
                ok(Vec::new())
            }
            ["zfs", "create", "-p", "-o", "canmount=off", name] => {
                let mut path = String::new();
                for part in name.split('/') {
                    if !path.is_empty() {
                        path.push('/');
                    }
                    path.push_str(part);
                    world.datasets.entry(path.clone()).or_default();
                }
                ok(Vec::new())
            }
            ["zfs", "send", "-t", token, "-n", "-v"] => {
                let found = token.strip_prefix("token:").and_then(|name| {
                    let (dataset, pit) = split(name);
                    let (_, suffix) = pit?;
                    let snap = world.datasets.get(dataset)?.snapshots.iter().find(|s| s.suffix == suffix)?;
                    Some(vec![
                        "resume token contents:".to_string(),
                        format!("toguid = {:x}", snap.guid),
                        format!("toname = {name}"),
                    ])
                });
                match found {
                    Some(lines) => ok(lines),
                    None => (255, Vec::new()),
                }
            }
            ["zfs", "recv", .., name] => {
                let Some(stream) = self.wire.stream.lock().unwrap().take() else {
                    return fail();
                };
                world.txg += 1;
                let txg = world.txg;
                let received = Snap {
                    suffix: stream.suffix,
                    guid: stream.guid,
                    txg,
                    written: 0,
                };

                match stream.base_guid {
                    None => {
                        let parent_missing = name
                            .rsplit_once('/')
                            .is_some_and(|(parent, _)| !world.datasets.contains_key(parent));
                        if parent_missing {
                            return fail();
                        }
                        let d = world.datasets.entry((*name).to_string()).or_default();
                        if !d.snapshots.is_empty() && !forced {
                            return fail();
                        }
                        d.snapshots.push(received);
                        d.resume_token = None;
                    }
                    Some(base) => {
                        let Some(d) = world.datasets.get_mut(*name) else { return fail() };
                        let Some(index) = d.snapshots.iter().position(|s| s.guid == base) else {
                            return fail();
                        };
                        if (index + 1 < d.snapshots.len() || d.dirty > 0) && !forced {
                            return fail();
                        }
                        d.snapshots.truncate(index + 1);
                        d.dirty = 0;
                        d.snapshots.push(received);
                        d.resume_token = None;
                    }
                }
                ok(Vec::new())
            }
            _ => (2, vec![format!("unknown command: {}", args.join(" "))]),
        }
    }
}

#[async_trait]
impl Runner for FakeHost {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn pipe(&self, cmd: &CmdLine, options: RunOptions) -> CmdPipe {
        let argv = cmd.argv();
        if let Some(stream) = self.prepare_send(&argv) {
            *self.wire.stream.lock().unwrap() = Some(stream);
        }
        self.with_world(|w| w.commands.push(cmd.to_string()));

        let mut pipe = CmdPipe::new(self.readonly);
        pipe.add(CmdItem::new(argv).readonly(options.is_readonly()));
        pipe
    }

    async fn run(&self, cmd: &CmdLine, mut options: RunOptions) -> Result<Option<RunOutput>, ExecuteError> {
        let piped_ok = match options.take_input() {
            Some(Input::Pipe(pipe)) => pipe.should_execute(),
            _ => true,
        };
        if (self.readonly && !options.is_readonly()) || !piped_ok {
            self.with_world(|w| w.skipped.push(cmd.to_string()));
            return Ok(None);
        }

        let argv = cmd.argv();
        let forced = argv.iter().any(|a| a == "-F");
        let (code, stdout) = self.execute(&argv, forced);
        self.with_world(|w| w.commands.push(cmd.to_string()));

        if !options.exit_codes().accepts(code) {
            return Err(ExecuteError::Exit {
                command: cmd.to_string(),
                code,
                accepts: options.exit_codes().clone(),
            });
        }
        Ok(Some(RunOutput {
            stdout,
            stderr: Vec::new(),
            exit_code: code,
        }))
    }
}
