//! Seed catalog of roles

use crate::caps::{Capability as C, CapabilitySet, Domain};
use crate::constants::{ROLE_ADMIN, ROLE_DIRECTOR, ROLE_EMPLOYEE, ROLE_GUEST, ROLE_MANAGER, ROLE_TEAM_LEAD};
use crate::error::Result;
use crate::registry::{Role, RoleRegistry};

fn domains(ds: &[Domain]) -> CapabilitySet {
    let mut set = CapabilitySet::empty();
    for d in ds {
        for c in C::in_domain(*d) {
            set.set(c, true);
        }
    }
    set
}

/// The fixed role catalog, most authoritative first.
pub fn catalog() -> Vec<Role> {
    // Everything outside administration and security, plus their read and people-facing parts
    let director = domains(&Domain::ALL.iter().copied().filter(|d| !matches!(d, Domain::Administration | Domain::Security)).collect::<Vec<_>>())
        .union(CapabilitySet::of(&[C::ViewSettings, C::ManageRoles, C::ViewAuditLogs, C::ViewSecurityEvents, C::ResetPasswords, C::ManageSessions]));

    let manager = CapabilitySet::of(&[
        C::ViewUsers, C::ViewTeams, C::EditTeams, C::ManageTeamMembers,
        C::ViewProjects, C::CreateProjects, C::EditProjects, C::ManageProjectMembers,
        C::ViewObjectives, C::CreateObjectives, C::EditObjectives, C::ApproveObjectives, C::AssignObjectives,
        C::ViewKpis, C::CreateKpis, C::EditKpis, C::UpdateKpiValues, C::SetKpiTargets,
        C::ViewReports, C::ExportReports, C::ViewAnalytics,
        C::ViewDocuments, C::UploadDocuments, C::EditDocuments, C::ShareDocuments,
        C::SendMessages, C::CreateChannels, C::SendAnnouncements, C::CreateEvents, C::EditEvents,
        C::ViewWorkflows, C::ApproveWorkflowSteps,
        C::ViewResources, C::AllocateResources, C::BookResources,
        C::ViewBudgets, C::ApproveExpenses,
        C::ViewTrainings, C::AssignTrainings, C::TrackTrainingProgress,
        C::ViewQualityMetrics, C::ApproveQualityChecks, C::ReportIncidents,
    ]);

    let team_lead = CapabilitySet::of(&[
        C::ViewUsers, C::ViewTeams, C::ManageTeamMembers,
        C::ViewProjects, C::EditProjects,
        C::ViewObjectives, C::CreateObjectives, C::EditObjectives, C::AssignObjectives,
        C::ViewKpis, C::UpdateKpiValues,
        C::ViewReports,
        C::ViewDocuments, C::UploadDocuments, C::EditDocuments, C::ShareDocuments,
        C::SendMessages, C::CreateChannels, C::CreateEvents, C::EditEvents,
        C::ViewWorkflows,
        C::ViewResources, C::BookResources,
        C::ViewTrainings, C::TrackTrainingProgress,
        C::ViewQualityMetrics, C::ReportIncidents,
    ]);

    let employee = CapabilitySet::of(&[
        C::ViewTeams, C::ViewProjects, C::ViewObjectives, C::ViewKpis, C::UpdateKpiValues,
        C::ViewDocuments, C::UploadDocuments,
        C::SendMessages, C::CreateEvents,
        C::ViewWorkflows, C::ViewResources, C::BookResources,
        C::ViewTrainings, C::ReportIncidents,
    ]);

    let guest = CapabilitySet::of(&[C::ViewProjects, C::ViewDocuments, C::ViewTrainings]);

    vec![
        Role::new(ROLE_ADMIN, "Administrator", "Full control of the organisation, including system settings", 1, CapabilitySet::all()),
        Role::new(ROLE_DIRECTOR, "Director", "Organisation-wide management without system administration", 2, director),
        Role::new(ROLE_MANAGER, "Manager", "Runs teams, projects, objectives and KPIs", 3, manager),
        Role::new(ROLE_TEAM_LEAD, "Team Lead", "Coordinates one team's day-to-day work", 4, team_lead),
        Role::new(ROLE_EMPLOYEE, "Employee", "Works on assigned objectives and KPIs", 5, employee),
        Role::new(ROLE_GUEST, "Guest", "Read-only access to shared material", 6, guest),
    ]
}

/// Seed the catalog unless the registry already holds roles.
pub fn bootstrap(registry: &RoleRegistry) -> Result<bool> {
    if registry.is_bootstrapped()? {
        return Ok(false);
    }
    registry.seed(&catalog())?;
    Ok(true)
}
