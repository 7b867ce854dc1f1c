use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A raid room as the store keeps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaidRoom {
    pub id: String,
    pub boss_name: String,
    pub raid_date: NaiveDate,
    pub raid_time: Option<NaiveTime>,
    pub completed: bool,
    pub channels: Vec<Channel>,
    pub created_at: DateTime<Utc>,
}

/// An in-game channel tracked inside a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub number: i32,
    pub memo: Option<String>,
    pub defeated_at: Option<DateTime<Utc>>,
}

impl RaidRoom {
    pub fn new(id: impl Into<String>, boss_name: impl Into<String>, raid_date: NaiveDate) -> Self {
        Self {
            id: id.into(),
            boss_name: boss_name.into(),
            raid_date,
            raid_time: None,
            completed: false,
            channels: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

impl Channel {
    pub fn new(id: impl Into<String>, number: i32) -> Self {
        Self {
            id: id.into(),
            number,
            memo: None,
            defeated_at: None,
        }
    }
}

/// One line of the summary listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSummary {
    pub id: String,
    pub channel_count: usize,
    pub defeated_count: usize,
    pub raid_date: NaiveDate,
    pub raid_time: Option<NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BossGroup {
    pub name: String,
    pub rooms: Vec<RoomSummary>,
}

/// The shared summary screen: open rooms grouped by boss.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Listing {
    pub bosses: Vec<BossGroup>,
}

impl Listing {
    /// Build the listing from every room, skipping completed ones and rooms
    /// dated before `today`.
    pub fn build<'a>(rooms: impl IntoIterator<Item = &'a RaidRoom>, today: NaiveDate) -> Self {
        let mut groups: BTreeMap<&str, Vec<RoomSummary>> = BTreeMap::new();
        for room in rooms {
            if room.completed || room.raid_date < today {
                continue;
            }
            groups
                .entry(room.boss_name.as_str())
                .or_default()
                .push(RoomSummary {
                    id: room.id.clone(),
                    channel_count: room.channels.len(),
                    defeated_count: room
                        .channels
                        .iter()
                        .filter(|c| c.defeated_at.is_some())
                        .count(),
                    raid_date: room.raid_date,
                    raid_time: room.raid_time,
                });
        }

        let bosses = groups
            .into_iter()
            .map(|(name, mut rooms)| {
                rooms.sort_by(|a, b| (a.raid_date, a.raid_time).cmp(&(b.raid_date, b.raid_time)));
                BossGroup {
                    name: name.to_string(),
                    rooms,
                }
            })
            .collect();

        Self { bosses }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn listing_groups_open_rooms_by_boss() {
        let mut dragon = RaidRoom::new("r1", "Water Dragon", date(10));
        dragon.channels.push(Channel::new("c1", 1));
        let mut defeated = Channel::new("c2", 2);
        defeated.defeated_at = Some(Utc::now());
        dragon.channels.push(defeated);

        let mut done = RaidRoom::new("r2", "Water Dragon", date(10));
        done.completed = true;
        let past = RaidRoom::new("r3", "Fire Dragon", date(1));
        let other = RaidRoom::new("r4", "Fire Dragon", date(12));

        let listing = Listing::build([&dragon, &done, &past, &other], date(5));

        assert_eq!(listing.bosses.len(), 2);
        assert_eq!(listing.bosses[0].name, "Fire Dragon");
        assert_eq!(listing.bosses[0].rooms[0].id, "r4");
        let water = &listing.bosses[1];
        assert_eq!(water.rooms.len(), 1);
        assert_eq!(water.rooms[0].channel_count, 2);
        assert_eq!(water.rooms[0].defeated_count, 1);
    }
}
