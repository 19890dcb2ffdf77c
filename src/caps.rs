//! Capability vocabulary and total capability sets
//!
//! The vocabulary is a closed enumeration. Each capability owns one bit of a
//! `u128`, so a [`CapabilitySet`] is total by construction: every capability
//! is either set or clear. Maps coming in from the outside are validated
//! against the vocabulary before they become sets.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{Deserializer, Error as _};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Bumped whenever capabilities are added or removed.
pub const VOCABULARY_VERSION: u32 = 1;

macro_rules! vocabulary {
    ($( $domain:ident { $( $variant:ident => $name:literal ),+ $(,)? } )+) => {
        /// A single named permission bit.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Capability { $( $( $variant, )+ )+ }

        /// Functional area a capability belongs to.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Domain { $( $domain, )+ }

        impl Capability {
            /// Every capability, in bit order.
            pub const ALL: &'static [Capability] = &[ $( $( Capability::$variant, )+ )+ ];

            /// Stable wire name, e.g. `canViewReports`.
            pub const fn name(self) -> &'static str {
                match self { $( $( Capability::$variant => $name, )+ )+ }
            }

            pub const fn domain(self) -> Domain {
                match self { $( $( Capability::$variant => Domain::$domain, )+ )+ }
            }
        }

        impl Domain {
            pub const ALL: &'static [Domain] = &[ $( Domain::$domain, )+ ];
        }
    };
}

vocabulary! {
    User {
        ViewUsers => "canViewUsers",
        CreateUsers => "canCreateUsers",
        EditUsers => "canEditUsers",
        DeleteUsers => "canDeleteUsers",
        AssignRoles => "canAssignRoles",
        ManageUserStatus => "canManageUserStatus",
    }
    Team {
        ViewTeams => "canViewTeams",
        CreateTeams => "canCreateTeams",
        EditTeams => "canEditTeams",
        DeleteTeams => "canDeleteTeams",
        ManageTeamMembers => "canManageTeamMembers",
        ArchiveTeams => "canArchiveTeams",
    }
    Project {
        ViewProjects => "canViewProjects",
        CreateProjects => "canCreateProjects",
        EditProjects => "canEditProjects",
        DeleteProjects => "canDeleteProjects",
        ArchiveProjects => "canArchiveProjects",
        ManageProjectMembers => "canManageProjectMembers",
    }
    Objective {
        ViewObjectives => "canViewObjectives",
        CreateObjectives => "canCreateObjectives",
        EditObjectives => "canEditObjectives",
        DeleteObjectives => "canDeleteObjectives",
        ApproveObjectives => "canApproveObjectives",
        AssignObjectives => "canAssignObjectives",
        ArchiveObjectives => "canArchiveObjectives",
    }
    Kpi {
        ViewKpis => "canViewKpis",
        CreateKpis => "canCreateKpis",
        EditKpis => "canEditKpis",
        DeleteKpis => "canDeleteKpis",
        UpdateKpiValues => "canUpdateKpiValues",
        SetKpiTargets => "canSetKpiTargets",
        ExportKpis => "canExportKpis",
    }
    Reporting {
        ViewReports => "canViewReports",
        CreateReports => "canCreateReports",
        EditReports => "canEditReports",
        DeleteReports => "canDeleteReports",
        ExportReports => "canExportReports",
        ScheduleReports => "canScheduleReports",
        ViewAnalytics => "canViewAnalytics",
    }
    Documents {
        ViewDocuments => "canViewDocuments",
        UploadDocuments => "canUploadDocuments",
        EditDocuments => "canEditDocuments",
        DeleteDocuments => "canDeleteDocuments",
        ShareDocuments => "canShareDocuments",
        ManageDocumentVersions => "canManageDocumentVersions",
    }
    Communication {
        SendMessages => "canSendMessages",
        CreateChannels => "canCreateChannels",
        ManageChannels => "canManageChannels",
        DeleteMessages => "canDeleteMessages",
        SendAnnouncements => "canSendAnnouncements",
        ManageNotifications => "canManageNotifications",
        CreateEvents => "canCreateEvents",
        EditEvents => "canEditEvents",
        DeleteEvents => "canDeleteEvents",
    }
    Administration {
        ViewSettings => "canViewSettings",
        EditSettings => "canEditSettings",
        ManageRoles => "canManageRoles",
        ViewAuditLogs => "canViewAuditLogs",
        ManageIntegrations => "canManageIntegrations",
        ManageBackups => "canManageBackups",
        ManageSystem => "canManageSystem",
    }
    Security {
        ManageSecurityPolicies => "canManageSecurityPolicies",
        ViewSecurityEvents => "canViewSecurityEvents",
        ManageApiKeys => "canManageApiKeys",
        ResetPasswords => "canResetPasswords",
        ManageSessions => "canManageSessions",
        ManageEncryption => "canManageEncryption",
    }
    Workflow {
        ViewWorkflows => "canViewWorkflows",
        CreateWorkflows => "canCreateWorkflows",
        EditWorkflows => "canEditWorkflows",
        DeleteWorkflows => "canDeleteWorkflows",
        ApproveWorkflowSteps => "canApproveWorkflowSteps",
        ManageAutomations => "canManageAutomations",
    }
    Resources {
        ViewResources => "canViewResources",
        AllocateResources => "canAllocateResources",
        EditResources => "canEditResources",
        ManageInventory => "canManageInventory",
        BookResources => "canBookResources",
        DeleteResources => "canDeleteResources",
    }
    Finance {
        ViewBudgets => "canViewBudgets",
        CreateBudgets => "canCreateBudgets",
        EditBudgets => "canEditBudgets",
        DeleteBudgets => "canDeleteBudgets",
        ApproveExpenses => "canApproveExpenses",
        ViewFinancialReports => "canViewFinancialReports",
        ManageInvoices => "canManageInvoices",
    }
    Training {
        ViewTrainings => "canViewTrainings",
        CreateTrainings => "canCreateTrainings",
        EditTrainings => "canEditTrainings",
        AssignTrainings => "canAssignTrainings",
        TrackTrainingProgress => "canTrackTrainingProgress",
        ManageCertifications => "canManageCertifications",
    }
    Quality {
        ViewQualityMetrics => "canViewQualityMetrics",
        CreateAudits => "canCreateAudits",
        ManageQualityStandards => "canManageQualityStandards",
        ApproveQualityChecks => "canApproveQualityChecks",
        ReportIncidents => "canReportIncidents",
        ManageCorrectiveActions => "canManageCorrectiveActions",
    }
}

const _: () = assert!(Capability::ALL.len() <= 128);

impl Capability {
    #[inline]
    pub const fn bit(self) -> u128 {
        1u128 << (self as u8)
    }

    /// Look up a capability by its wire name.
    pub fn from_name(name: &str) -> Option<Capability> {
        Capability::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Capabilities of one domain, in bit order.
    pub fn in_domain(domain: Domain) -> impl Iterator<Item = Capability> {
        Capability::ALL.iter().copied().filter(move |c| c.domain() == domain)
    }
}

impl AsRef<str> for Capability {
    fn as_ref(&self) -> &str {
        self.name()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// SHA-256 over the ordered capability names, hex encoded.
///
/// Two builds agree on the bit layout iff their digests match.
pub fn vocabulary_digest() -> String {
    let mut hasher = Sha256::new();
    for cap in Capability::ALL {
        hasher.update(cap.name().as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

// ============================================================================
// CapabilitySet
// ============================================================================

/// Total assignment of a boolean to every capability in the vocabulary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapabilitySet(u128);

impl CapabilitySet {
    const VALID: u128 = if Capability::ALL.len() == 128 {
        u128::MAX
    } else {
        (1u128 << Capability::ALL.len()) - 1
    };

    /// Every capability denied.
    pub const fn empty() -> Self {
        CapabilitySet(0)
    }

    /// Every capability granted.
    pub const fn all() -> Self {
        CapabilitySet(Self::VALID)
    }

    /// Grant exactly the listed capabilities.
    pub fn of(granted: &[Capability]) -> Self {
        CapabilitySet(granted.iter().fold(0, |m, c| m | c.bit()))
    }

    /// Rebuild a set from raw bits, rejecting bits outside the vocabulary.
    pub fn from_bits(bits: u128) -> Result<Self> {
        if bits & !Self::VALID != 0 {
            return Err(Error::Validation(format!("bits {:#x} outside the capability vocabulary", bits & !Self::VALID)));
        }
        Ok(CapabilitySet(bits))
    }

    #[inline]
    pub const fn bits(self) -> u128 {
        self.0
    }

    #[inline]
    pub const fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn set(&mut self, cap: Capability, granted: bool) {
        if granted { self.0 |= cap.bit() } else { self.0 &= !cap.bit() }
    }

    /// Copy with one capability changed.
    pub fn with(mut self, cap: Capability, granted: bool) -> Self {
        self.set(cap, granted);
        self
    }

    pub fn union(self, other: CapabilitySet) -> Self {
        CapabilitySet(self.0 | other.0)
    }

    pub fn granted(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.iter().copied().filter(move |c| self.contains(*c))
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Every capability name mapped to its value.
    pub fn to_map(self) -> BTreeMap<String, bool> {
        Capability::ALL.iter().map(|c| (c.name().to_string(), self.contains(*c))).collect()
    }

    /// Validate a name -> bool map against the vocabulary.
    ///
    /// Missing keys and unknown keys are both rejected; nothing is filled in.
    pub fn from_map(map: &BTreeMap<String, bool>) -> Result<Self> {
        let unknown: Vec<&str> = map.keys().map(String::as_str).filter(|k| Capability::from_name(k).is_none()).collect();
        let missing: Vec<&str> = Capability::ALL.iter().map(|c| c.name()).filter(|n| !map.contains_key(*n)).collect();
        if !unknown.is_empty() || !missing.is_empty() {
            return Err(Error::Validation(format!(
                "capability map must cover the vocabulary exactly (missing: [{}], unknown: [{}])",
                missing.join(", "),
                unknown.join(", ")
            )));
        }
        let mut set = CapabilitySet::empty();
        for cap in Capability::ALL {
            set.set(*cap, map[cap.name()]);
        }
        Ok(set)
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.granted().map(Capability::name)).finish()
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Capability::ALL.len()))?;
        for cap in Capability::ALL {
            map.serialize_entry(cap.name(), &self.contains(*cap))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = BTreeMap::<String, bool>::deserialize(deserializer)?;
        CapabilitySet::from_map(&map).map_err(D::Error::custom)
    }
}
