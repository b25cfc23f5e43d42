//! Packing shell units into output units while threading the registration
//! call through every native-backed class.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::dex::clinit::{ClinitRewriter, RegistrationCall};
use crate::dex::{ClassDef, DexUnit, RefCounts};
use crate::protect::config::{CeilingMode, GlobalConfig, UnitConfig};
use crate::protect::error::{Diagnostics, ProtectError, Severity};
use crate::protect::main_chain::MainClassSet;
use crate::protect::pool::{DexPool, PoolFull};
use crate::protect::units::unit_entry_name;

/// An output unit written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedUnit {
    /// Canonical archive entry name, `classes.dex`, `classes2.dex`, ...
    pub entry_name: String,
    pub path: PathBuf,
    pub counts: RefCounts,
    pub classes: Vec<String>,
}

/// Packs classes into pools of bounded size and flushes each full pool to
/// `out_dir` as soon as the next one is started, so at most one pool is held
/// in memory. Output units are numbered in flush order.
pub struct DexPoolInjector<'r> {
    rewriter: &'r dyn ClinitRewriter,
    ceiling: u32,
    mode: CeilingMode,
    out_dir: PathBuf,
    version: u32,
    current: DexPool,
    flushed: Vec<FlushedUnit>,
}

impl<'r> DexPoolInjector<'r> {
    pub fn new(rewriter: &'r dyn ClinitRewriter, ceiling: u32, mode: CeilingMode, out_dir: &Path, version: u32) -> Self {
        DexPoolInjector {
            rewriter,
            ceiling,
            mode,
            out_dir: out_dir.to_path_buf(),
            version,
            current: DexPool::new(ceiling, mode),
            flushed: Vec::new(),
        }
    }

    /// Pack every unit of `global` in order. Classes of `main` go first, into
    /// what becomes the primary unit.
    pub fn run(
        mut self,
        global: &GlobalConfig,
        holder: &str,
        main: &MainClassSet,
        diags: &mut Diagnostics<'_>,
    ) -> Result<Vec<FlushedUnit>, ProtectError> {
        fs::create_dir_all(&self.out_dir)?;
        let configs = global.configs();

        // each unit is rewritten as a whole so that a failure rolls back its
        // pinned classes too
        let mut prepared: Vec<Option<Vec<ClassDef>>> = Vec::with_capacity(configs.len());
        for (i, config) in configs.iter().enumerate() {
            let classes = match self.load(i, config, diags)? {
                Some(unit) => Some(self.prepare(i, config, holder, unit.classes, diags)?),
                None => None,
            };
            prepared.push(classes);
        }

        if !main.is_empty() {
            for (i, slot) in prepared.iter_mut().enumerate() {
                let Some(classes) = slot.take() else {
                    continue;
                };
                let (pinned, rest): (Vec<ClassDef>, Vec<ClassDef>) =
                    classes.into_iter().partition(|c| main.contains(&c.descriptor));
                *slot = Some(rest);
                for class in pinned {
                    let descriptor = class.descriptor.clone();
                    if let Err(PoolFull(_)) = self.current.try_intern(class) {
                        return Err(ProtectError::InjectionFailure {
                            unit: i,
                            reason: format!(
                                "main class {} does not fit in the primary unit (ceiling {})",
                                descriptor, self.ceiling
                            ),
                        });
                    }
                }
            }
            debug!("{} main classes pinned to the primary unit", self.current.len());
        }

        let last = configs.len();
        for (i, slot) in prepared.into_iter().enumerate() {
            let Some(classes) = slot else {
                continue;
            };
            let flushed_before = self.flushed.len();
            for class in classes {
                self.intern(i, class, diags)?;
            }
            let overflowed = self.flushed.len() > flushed_before;
            if overflowed && i + 1 != last {
                debug!("unit {} overflowed, carrying {} classes into the next unit", i, self.current.len());
            } else if !self.current.is_empty() {
                self.flush()?;
            }
        }

        if !self.current.is_empty() || self.flushed.is_empty() {
            self.flush()?;
        }
        info!("packed {} units into {} output units", configs.len(), self.flushed.len());
        Ok(self.flushed)
    }

    fn load(&self, i: usize, config: &UnitConfig, diags: &mut Diagnostics<'_>) -> Result<Option<DexUnit>, ProtectError> {
        match DexUnit::from_file(&config.shell_unit) {
            Ok(unit) => Ok(Some(unit)),
            Err(err) => {
                diags.degrade(
                    Severity::Error,
                    ProtectError::InjectionFailure {
                        unit: i,
                        reason: format!("shell unit {} is unreadable: {}", config.shell_unit.display(), err),
                    },
                )?;
                Ok(None)
            }
        }
    }

    /// Inject the registration call into every native-backed class of
    /// `classes`. If any class cannot be rewritten, all of them are returned
    /// untouched.
    fn prepare(
        &self,
        i: usize,
        config: &UnitConfig,
        holder: &str,
        mut classes: Vec<ClassDef>,
        diags: &mut Diagnostics<'_>,
    ) -> Result<Vec<ClassDef>, ProtectError> {
        let mut originals = Vec::new();
        let mut failure = None;
        for (pos, class) in classes.iter_mut().enumerate() {
            let Some(class_index) = config.native_index(&class.descriptor) else {
                continue;
            };
            let before = class.clone();
            let call = RegistrationCall::new(holder, &config.register_method, class_index);
            match self.rewriter.inject(class, &call) {
                Ok(()) => originals.push((pos, before)),
                Err(err) => {
                    *class = before;
                    failure = Some(format!("static initializer of {}: {}", class.descriptor, err));
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            for (pos, original) in originals {
                classes[pos] = original;
            }
            diags.degrade(Severity::Error, ProtectError::InjectionFailure { unit: i, reason })?;
            debug!("unit {} packed without native registration", i);
        } else if !originals.is_empty() {
            debug!("injected registration into {} classes of unit {}", originals.len(), i);
        }
        Ok(classes)
    }

    fn intern(&mut self, i: usize, class: ClassDef, diags: &mut Diagnostics<'_>) -> Result<(), ProtectError> {
        let class = match self.current.try_intern(class) {
            Ok(()) => return Ok(()),
            Err(PoolFull(class)) => class,
        };
        if !self.current.is_empty() {
            self.flush()?;
            match self.current.try_intern(class) {
                Ok(()) => return Ok(()),
                Err(PoolFull(class)) => return self.oversized(i, class, diags),
            }
        }
        self.oversized(i, class, diags)
    }

    fn oversized(&self, i: usize, class: ClassDef, diags: &mut Diagnostics<'_>) -> Result<(), ProtectError> {
        let counts = class.references().counts();
        diags.degrade(
            Severity::Error,
            ProtectError::InjectionFailure {
                unit: i,
                reason: format!(
                    "{} alone needs {} references, over the ceiling of {}",
                    class.descriptor,
                    self.mode.measure(&counts),
                    self.ceiling
                ),
            },
        )
    }

    fn flush(&mut self) -> Result<(), ProtectError> {
        let pool = std::mem::replace(&mut self.current, DexPool::new(self.ceiling, self.mode));
        let entry_name = unit_entry_name(self.flushed.len());
        let path = self.out_dir.join(&entry_name);
        let counts = pool.counts();
        fs::write(&path, pool.encode(self.version)?)?;
        info!("flushed {} with {} classes ({})", entry_name, pool.len(), counts);
        self.flushed.push(FlushedUnit {
            entry_name,
            path,
            counts,
            classes: pool.classes().iter().map(|c| c.descriptor.clone()).collect(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::clinit::PrependRegistrationCall;
    use crate::dex::DexError;
    use crate::protect::error::LogSink;
    use crate::tests::fixtures::{class_with_field, write_dex_file};

    const HOLDER: &str = "Lcom/app/NativeUtil;";

    fn shell(dir: &Path, name: &str, descriptors: &[&str], native: &[&str]) -> UnitConfig {
        let path = dir.join(name);
        let classes: Vec<_> = descriptors.iter().map(|d| class_with_field(d)).collect();
        write_dex_file(&path, &classes);
        UnitConfig::new(
            path,
            &format!("register_{name}").replace('.', "_"),
            "com/app/NativeUtil",
            native.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn run(
        dir: &Path,
        ceiling: u32,
        configs: Vec<UnitConfig>,
        main: &MainClassSet,
        diags: &mut Diagnostics<'_>,
    ) -> Result<Vec<FlushedUnit>, ProtectError> {
        DexPoolInjector::new(&PrependRegistrationCall, ceiling, CeilingMode::Combined, &dir.join("out"), 35).run(
            &GlobalConfig::new(configs),
            HOLDER,
            main,
            diags,
        )
    }

    #[test]
    fn one_split_for_five_classes() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell(dir.path(), "a.dex", &["La0;", "La1;", "La2;", "La3;", "La4;"], &[]);
        let mut diags = Diagnostics::new(None);
        let units = run(dir.path(), 8, vec![config], &MainClassSet::default(), &mut diags).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].entry_name, "classes.dex");
        assert_eq!(units[0].classes, ["La0;", "La1;", "La2;"]);
        assert_eq!(units[1].entry_name, "classes2.dex");
        assert_eq!(units[1].classes, ["La3;", "La4;"]);
        assert!(units.iter().all(|u| u.counts.total() <= 8));
    }

    #[test]
    fn fitting_units_flush_separately_and_overflow_carries() {
        let dir = tempfile::tempdir().unwrap();
        let configs = vec![
            shell(dir.path(), "a.dex", &["La0;", "La1;"], &[]),
            shell(dir.path(), "b.dex", &["Lb0;", "Lb1;", "Lb2;", "Lb3;"], &[]),
            shell(dir.path(), "c.dex", &["Lc0;"], &[]),
        ];
        let mut diags = Diagnostics::new(None);
        let units = run(dir.path(), 8, configs, &MainClassSet::default(), &mut diags).unwrap();
        let names: Vec<_> = units.iter().map(|u| u.entry_name.as_str()).collect();
        assert_eq!(names, ["classes.dex", "classes2.dex", "classes3.dex"]);
        assert_eq!(units[0].classes, ["La0;", "La1;"]);
        assert_eq!(units[1].classes, ["Lb0;", "Lb1;", "Lb2;"]);
        // b's last pool stays open and receives c
        assert_eq!(units[2].classes, ["Lb3;", "Lc0;"]);
    }

    #[test]
    fn main_classes_land_in_primary() {
        let dir = tempfile::tempdir().unwrap();
        let configs = vec![
            shell(dir.path(), "a.dex", &["La0;", "La1;", "La2;"], &[]),
            shell(dir.path(), "b.dex", &["Lcom/app/App;"], &["Lcom/app/App;"]),
        ];
        let mut main = MainClassSet::default();
        main.insert("Lcom/app/App;");
        let mut diags = Diagnostics::new(None);
        let units = run(dir.path(), 100, configs, &main, &mut diags).unwrap();
        assert_eq!(units[0].classes[0], "Lcom/app/App;");
        assert!(units[1..].iter().all(|u| !u.classes.contains(&"Lcom/app/App;".to_string())));

        let primary = DexUnit::from_file(&units[0].path).unwrap();
        assert!(primary.class("Lcom/app/App;").unwrap().static_initializer().is_some());
    }

    #[test]
    fn native_classes_get_registration_call() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell(dir.path(), "a.dex", &["La0;", "La1;"], &["La1;"]);
        let mut diags = Diagnostics::new(None);
        let units = run(dir.path(), 100, vec![config], &MainClassSet::default(), &mut diags).unwrap();
        let unit = DexUnit::from_file(&units[0].path).unwrap();
        assert!(unit.class("La0;").unwrap().static_initializer().is_none());
        let code = unit.class("La1;").unwrap().static_initializer().unwrap().code.as_ref().unwrap();
        // const v0, #0 ; invoke-static {v0}
        assert_eq!(&code.insns[..4], &[0x0014, 0, 0, 0x1071]);
    }

    struct Refuse;

    impl ClinitRewriter for Refuse {
        fn inject(&self, class: &mut ClassDef, _call: &RegistrationCall) -> Result<(), DexError> {
            class.descriptor.push_str("broken");
            Err(DexError::new("refused"))
        }
    }

    #[test]
    fn failed_rewrite_is_fatal_without_sink() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell(dir.path(), "a.dex", &["La0;"], &["La0;"]);
        let mut diags = Diagnostics::new(None);
        let err = DexPoolInjector::new(&Refuse, 100, CeilingMode::Combined, &dir.path().join("out"), 35)
            .run(&GlobalConfig::new(vec![config]), HOLDER, &MainClassSet::default(), &mut diags)
            .unwrap_err();
        assert!(matches!(err, ProtectError::InjectionFailure { unit: 0, .. }));
    }

    #[test]
    fn failed_rewrite_keeps_classes_with_sink() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell(dir.path(), "a.dex", &["La0;", "La1;"], &["La0;", "La1;"]);
        let sink = LogSink;
        let mut diags = Diagnostics::new(Some(&sink));
        let units = DexPoolInjector::new(&Refuse, 100, CeilingMode::Combined, &dir.path().join("out"), 35)
            .run(&GlobalConfig::new(vec![config]), HOLDER, &MainClassSet::default(), &mut diags)
            .unwrap();
        assert_eq!(units[0].classes, ["La0;", "La1;"]);
        assert!(diags.finish(()).is_degraded());
    }

    /// Fails only on one class.
    struct RefuseOne(&'static str);

    impl ClinitRewriter for RefuseOne {
        fn inject(&self, class: &mut ClassDef, call: &RegistrationCall) -> Result<(), DexError> {
            if class.descriptor == self.0 {
                return Err(DexError::new("refused"));
            }
            PrependRegistrationCall.inject(class, call)
        }
    }

    #[test]
    fn failed_rewrite_rolls_back_pinned_and_regular_classes_together() {
        for refused in ["La0;", "La1;"] {
            let dir = tempfile::tempdir().unwrap();
            let config = shell(dir.path(), "a.dex", &["La0;", "La1;"], &["La0;", "La1;"]);
            let mut main = MainClassSet::default();
            main.insert("La0;");
            let sink = LogSink;
            let mut diags = Diagnostics::new(Some(&sink));
            let units = DexPoolInjector::new(&RefuseOne(refused), 100, CeilingMode::Combined, &dir.path().join("out"), 35)
                .run(&GlobalConfig::new(vec![config]), HOLDER, &main, &mut diags)
                .unwrap();
            assert_eq!(units[0].classes, ["La0;", "La1;"]);

            let unit = DexUnit::from_file(&units[0].path).unwrap();
            assert!(unit.class("La0;").unwrap().static_initializer().is_none(), "{refused}");
            assert!(unit.class("La1;").unwrap().static_initializer().is_none(), "{refused}");
            assert_eq!(diags.finish(()).diagnostics.len(), 1);
        }
    }

    #[test]
    fn unreadable_shell_is_skipped_with_sink() {
        let dir = tempfile::tempdir().unwrap();
        let good = shell(dir.path(), "a.dex", &["La0;"], &[]);
        let bad = UnitConfig::new(dir.path().join("missing.dex"), "r", "com/app/NativeUtil", vec![]);
        let sink = LogSink;
        let mut diags = Diagnostics::new(Some(&sink));
        let units = run(dir.path(), 100, vec![bad, good], &MainClassSet::default(), &mut diags).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].classes, ["La0;"]);
        assert_eq!(diags.finish(()).diagnostics.len(), 1);
    }

    #[test]
    fn oversized_main_set_is_fatal_even_with_sink() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell(dir.path(), "a.dex", &["La0;", "La1;"], &[]);
        let mut main = MainClassSet::default();
        main.insert("La0;");
        main.insert("La1;");
        let sink = LogSink;
        let mut diags = Diagnostics::new(Some(&sink));
        assert!(run(dir.path(), 5, vec![config], &main, &mut diags).is_err());
    }
}
