// Copyright (c) 2017-2019 Fabian Schuiki

//! Inline-cache records.
//!
//! An inline cache records, for one call site, which combinations of argument
//! classes have been observed and which function each combination dispatched
//! to. The records are produced by the unoptimized code and shared read-only
//! with the optimizer. Narrowed views are new records; the original is never
//! touched.

use crate::ir::{ClassId, FunctionId};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Reasons for which optimized code at a call site deoptimized before.
    #[derive(Default, Serialize, Deserialize)]
    pub struct DeoptReasons: u8 {
        const BINARY_SMI_OP = 0b0001;
        const BINARY_MINT_OP = 0b0010;
        const SHIFT_MINT_OP = 0b0100;
        const CHECK_SMI = 0b1000;
        const DOUBLE_TO_SMI = 0b1_0000;
    }
}

/// One observation of an inline cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IcCheck {
    /// The classes of the tested arguments, receiver first.
    pub class_ids: Vec<ClassId>,
    /// The function the call dispatched to.
    pub target: FunctionId,
    /// How often this combination was seen.
    pub count: usize,
}

/// The inline-cache record of a call site.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IcData {
    /// The selector called at the site.
    pub target_name: String,
    /// The number of leading arguments whose classes are recorded.
    pub num_args_tested: usize,
    /// Speculations that already failed at this site.
    pub deopt_reasons: DeoptReasons,
    checks: Vec<IcCheck>,
}

impl IcData {
    /// Create an empty record.
    pub fn new(target_name: impl Into<String>, num_args_tested: usize) -> Self {
        Self {
            target_name: target_name.into(),
            num_args_tested,
            deopt_reasons: DeoptReasons::empty(),
            checks: vec![],
        }
    }

    /// Record an observation of the given argument classes.
    pub fn add_check(&mut self, class_ids: Vec<ClassId>, target: FunctionId) {
        assert_eq!(class_ids.len(), self.num_args_tested);
        self.checks.push(IcCheck {
            class_ids,
            target,
            count: 1,
        });
    }

    /// Record an observation of a receiver class.
    ///
    /// Small integers are always kept as the first check.
    pub fn add_receiver_check(&mut self, class_id: ClassId, target: FunctionId, count: usize) {
        assert_eq!(self.num_args_tested, 1);
        let check = IcCheck {
            class_ids: vec![class_id],
            target,
            count,
        };
        if class_id == ClassId::SMI {
            self.checks.insert(0, check);
        } else {
            self.checks.push(check);
        }
    }

    /// Mark the record with a failed speculation.
    pub fn with_deopt_reason(mut self, reason: DeoptReasons) -> Self {
        self.deopt_reasons |= reason;
        self
    }

    /// The number of observations.
    pub fn number_of_checks(&self) -> usize {
        self.checks.len()
    }

    /// Check whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Access an observation.
    pub fn check_at(&self, index: usize) -> &IcCheck {
        &self.checks[index]
    }

    /// Iterate over all observations.
    pub fn checks(&self) -> impl Iterator<Item = &IcCheck> {
        self.checks.iter()
    }

    /// The receiver class of an observation.
    pub fn receiver_class_id_at(&self, index: usize) -> ClassId {
        self.checks[index].class_ids[0]
    }

    /// The target of an observation.
    pub fn target_at(&self, index: usize) -> FunctionId {
        self.checks[index].target
    }

    /// Check whether a failed speculation was recorded.
    pub fn has_deopt_reason(&self, reason: DeoptReasons) -> bool {
        self.deopt_reasons.contains(reason)
    }

    /// Check whether all observations dispatched to the same function.
    pub fn has_one_target(&self) -> bool {
        match self.checks.first() {
            Some(first) => self.checks.iter().all(|c| c.target == first.target),
            None => false,
        }
    }

    /// Check whether the receiver class was observed.
    pub fn has_receiver_class_id(&self, class_id: ClassId) -> bool {
        self.checks.iter().any(|c| c.class_ids[0] == class_id)
    }

    /// The target recorded for a receiver class.
    pub fn target_for_receiver(&self, class_id: ClassId) -> Option<FunctionId> {
        self.checks
            .iter()
            .find(|c| c.class_ids[0] == class_id)
            .map(|c| c.target)
    }

    /// Derive a record that only tests the receiver.
    pub fn as_unary_class_checks(&self) -> IcData {
        self.as_unary_class_checks_for_argument(0)
    }

    /// Derive a record that only tests the class of one argument.
    ///
    /// Observations with equal classes are merged and their counts summed.
    pub fn as_unary_class_checks_for_argument(&self, arg: usize) -> IcData {
        assert!(arg < self.num_args_tested);
        let mut result = IcData::new(self.target_name.clone(), 1);
        result.deopt_reasons = self.deopt_reasons;
        for check in &self.checks {
            if check.count == 0 {
                continue;
            }
            let class_id = check.class_ids[arg];
            match result.checks.iter_mut().find(|c| c.class_ids[0] == class_id) {
                Some(existing) => existing.count += check.count,
                None => result.add_receiver_check(class_id, check.target, check.count),
            }
        }
        result
    }

    /// Check whether every observation has all tested arguments drawn from
    /// the given classes.
    pub fn all_checks_within(&self, arg_count: usize, allowed: &[ClassId]) -> bool {
        !self.checks.is_empty()
            && self.checks.iter().all(|c| {
                c.class_ids
                    .iter()
                    .take(arg_count)
                    .all(|cid| allowed.contains(cid))
            })
    }
}

impl fmt::Display for IcData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IC[{}: ", self.target_name)?;
        for (i, check) in self.checks.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            for (j, cid) in check.class_ids.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", cid)?;
            }
        }
        write!(f, "]")
    }
}
