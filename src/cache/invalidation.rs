//! Invalidation on write.
//!
//! Mutation handlers report what they changed as a [`CacheAction`]; the
//! table in [`CacheAction::targets`] maps each action to the cached reads
//! it makes stale. Add a row here whenever a new cached endpoint is exposed.

use super::keys::{
    shared_route_prefix, user_route_pattern, user_route_prefix, user_scope_prefix, CacheTier,
    API_PREFIX,
};
use super::ResponseCache;
use crate::error::AppError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Business actions that make cached reads stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheAction {
    UserUpdate,
    UserSubscriptionChange,
    EnergyPointsChange,
    TeamCreate,
    TeamUpdate,
    TeamMemberAdd,
    TeamMemberRemove,
    CourseUpdate,
    LessonUpdate,
    MeditationUpdate,
    ShopPurchase,
    GamificationXpChange,
    GamificationAchievementUnlock,
}

impl CacheAction {
    pub const ALL: [CacheAction; 13] = [
        CacheAction::UserUpdate,
        CacheAction::UserSubscriptionChange,
        CacheAction::EnergyPointsChange,
        CacheAction::TeamCreate,
        CacheAction::TeamUpdate,
        CacheAction::TeamMemberAdd,
        CacheAction::TeamMemberRemove,
        CacheAction::CourseUpdate,
        CacheAction::LessonUpdate,
        CacheAction::MeditationUpdate,
        CacheAction::ShopPurchase,
        CacheAction::GamificationXpChange,
        CacheAction::GamificationAchievementUnlock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheAction::UserUpdate => "user.update",
            CacheAction::UserSubscriptionChange => "user.subscription.change",
            CacheAction::EnergyPointsChange => "energy_points.change",
            CacheAction::TeamCreate => "team.create",
            CacheAction::TeamUpdate => "team.update",
            CacheAction::TeamMemberAdd => "team.member.add",
            CacheAction::TeamMemberRemove => "team.member.remove",
            CacheAction::CourseUpdate => "course.update",
            CacheAction::LessonUpdate => "lesson.update",
            CacheAction::MeditationUpdate => "meditation.update",
            CacheAction::ShopPurchase => "shop.purchase",
            CacheAction::GamificationXpChange => "gamification.xp.change",
            CacheAction::GamificationAchievementUnlock => "gamification.achievement.unlock",
        }
    }

    /// Whether the action only touches the acting user's reads
    pub fn requires_user(&self) -> bool {
        matches!(
            self,
            CacheAction::UserUpdate
                | CacheAction::UserSubscriptionChange
                | CacheAction::EnergyPointsChange
                | CacheAction::ShopPurchase
                | CacheAction::GamificationXpChange
                | CacheAction::GamificationAchievementUnlock
        )
    }

    /// Cached reads made stale by the action.
    ///
    /// Empty when the action needs a user id and the context has none.
    pub fn targets(&self, ctx: &InvalidationContext) -> Vec<InvalidationTarget> {
        let user_id = ctx.user_id.as_deref().filter(|id| !id.is_empty());
        if self.requires_user() && user_id.is_none() {
            return Vec::new();
        }

        let ratings = || {
            InvalidationTarget::Prefix(shared_route_prefix(
                CacheTier::Hot,
                &format!("{}/ratings", API_PREFIX),
            ))
        };

        match (self, user_id) {
            (CacheAction::UserUpdate | CacheAction::UserSubscriptionChange, Some(user_id)) => {
                vec![InvalidationTarget::Prefix(user_scope_prefix(user_id))]
            }
            // Leaderboards aggregate every user's points
            (CacheAction::EnergyPointsChange, Some(user_id)) => vec![
                InvalidationTarget::Prefix(user_scope_prefix(user_id)),
                ratings(),
            ],
            (
                CacheAction::TeamCreate
                | CacheAction::TeamUpdate
                | CacheAction::TeamMemberAdd
                | CacheAction::TeamMemberRemove,
                _,
            ) => {
                let teams = match ctx.team_id.as_deref().filter(|id| !id.is_empty()) {
                    Some(team_id) => format!("{}/teams/{}", API_PREFIX, team_id),
                    None => format!("{}/teams", API_PREFIX),
                };
                vec![
                    InvalidationTarget::Pattern(user_route_pattern(&teams)),
                    ratings(),
                ]
            }
            (CacheAction::CourseUpdate | CacheAction::LessonUpdate | CacheAction::MeditationUpdate, _) => {
                vec![
                    InvalidationTarget::Pattern(user_route_pattern(&format!(
                        "{}/courses",
                        API_PREFIX
                    ))),
                    InvalidationTarget::Pattern(user_route_pattern(&format!(
                        "{}/meditations",
                        API_PREFIX
                    ))),
                ]
            }
            (CacheAction::ShopPurchase, Some(user_id)) => vec![
                InvalidationTarget::Prefix(user_scope_prefix(user_id)),
                InvalidationTarget::Pattern(user_route_pattern(&format!("{}/shop", API_PREFIX))),
            ],
            // Profiles show XP, so every viewer's copy of the profile goes too
            (
                CacheAction::GamificationXpChange | CacheAction::GamificationAchievementUnlock,
                Some(user_id),
            ) => vec![
                InvalidationTarget::Prefix(user_route_prefix(
                    user_id,
                    &format!("{}/gamification", API_PREFIX),
                )),
                InvalidationTarget::Pattern(user_route_pattern(&format!(
                    "{}/users/{}",
                    API_PREFIX, user_id
                ))),
            ],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for CacheAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| AppError::BadRequest(format!("Unknown cache invalidation action: {}", s)))
    }
}

/// Identifiers of the entities a mutation touched
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InvalidationContext {
    #[serde(alias = "userId")]
    pub user_id: Option<String>,
    #[serde(alias = "teamId")]
    pub team_id: Option<String>,
    #[serde(alias = "courseId")]
    pub course_id: Option<String>,
    #[serde(alias = "meditationId")]
    pub meditation_id: Option<String>,
}

impl InvalidationContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn for_team(team_id: impl Into<String>) -> Self {
        Self {
            team_id: Some(team_id.into()),
            ..Default::default()
        }
    }
}

/// A family of cache entries to remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    /// Literal key prefix
    Prefix(String),
    /// Glob pattern, for families spread over every user's scope
    Pattern(String),
}

impl ResponseCache {
    /// Invalidate the reads made stale by a named action.
    ///
    /// Never fails: unknown actions are logged and ignored, store failures
    /// leave entries to expire on their TTL.
    pub async fn invalidate_for_action(&self, action: &str, ctx: &InvalidationContext) -> u64 {
        match action.parse::<CacheAction>() {
            Ok(action) => self.invalidate_action(action, ctx).await,
            Err(_) => {
                warn!(action = %action, "Unknown cache invalidation action");
                0
            }
        }
    }

    /// Invalidate the reads made stale by `action`
    pub async fn invalidate_action(&self, action: CacheAction, ctx: &InvalidationContext) -> u64 {
        let targets = action.targets(ctx);
        if targets.is_empty() {
            debug!(action = %action, "Cache invalidation skipped, no user id");
            return 0;
        }

        let mut removed = 0;
        for target in &targets {
            removed += match target {
                InvalidationTarget::Prefix(prefix) => self.invalidate_by_prefix(prefix).await,
                InvalidationTarget::Pattern(pattern) => self.invalidate_matching(pattern).await,
            };
        }

        debug!(
            action = %action,
            user_id = ?ctx.user_id,
            team_id = ?ctx.team_id,
            removed,
            "Cache invalidated for action"
        );
        removed
    }
}
