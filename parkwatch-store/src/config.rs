//! The NVR configuration tree (nvr -> channel -> parking space) and
//! auto rules. Ownership cascades on delete at the schema level.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use parkwatch_types::{
    AutoRule, BBox, ChannelCode, ChannelConfig, ExecutionStatus, ExternalDbCoords, NvrConfig,
    ParkingSpace,
};

use crate::{from_millis, millis, Result, Store};

#[derive(Debug, Clone)]
pub struct NewNvrConfig {
    pub site_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub external_db: Option<ExternalDbCoords>,
}

#[derive(Debug, Clone)]
pub struct NewChannelConfig {
    pub channel_code: ChannelCode,
    pub camera_ip: String,
    pub display_name: String,
    pub vendor_sn: String,
    pub track_space: String,
    pub spaces: Vec<ParkingSpace>,
}

#[derive(Debug, Clone)]
pub struct NewAutoRule {
    pub use_today: bool,
    pub custom_date: Option<String>,
    pub base_rtsp: String,
    pub channel: ChannelCode,
    pub interval_minutes: u32,
    pub trigger_time: String,
    pub is_enabled: bool,
}

fn rule_from_row(row: &rusqlite::Row) -> rusqlite::Result<AutoRule> {
    let channel: String = row.get("channel")?;
    let status: String = row.get("last_execution_status")?;
    let last_executed_at: Option<i64> = row.get("last_executed_at")?;
    Ok(AutoRule {
        id: row.get("id")?,
        use_today: row.get("use_today")?,
        custom_date: row.get("custom_date")?,
        base_rtsp: row.get("base_rtsp")?,
        channel: ChannelCode::parse(&channel).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        interval_minutes: row.get("interval_minutes")?,
        trigger_time: row.get("trigger_time")?,
        is_enabled: row.get("is_enabled")?,
        execution_count: row.get("execution_count")?,
        last_executed_at: last_executed_at.map(from_millis),
        last_execution_status: ExecutionStatus::parse(&status),
        last_execution_error: row.get("last_execution_error")?,
    })
}

const RULE_COLS: &str = "id, use_today, custom_date, base_rtsp, channel, interval_minutes, \
     trigger_time, is_enabled, execution_count, last_executed_at, \
     last_execution_status, last_execution_error";

impl Store {
    pub fn create_nvr(&self, nvr: &NewNvrConfig) -> Result<i64> {
        let conn = self.conn.lock();
        let (h, p, u, pw, db) = match &nvr.external_db {
            Some(e) => (
                Some(e.host.clone()),
                Some(e.port),
                Some(e.user.clone()),
                Some(e.password.clone()),
                Some(e.db_name.clone()),
            ),
            None => (None, None, None, None, None),
        };
        conn.execute(
            "INSERT INTO nvr_config
             (site_name, host, port, user, password,
              ext_db_host, ext_db_port, ext_db_user, ext_db_password, ext_db_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![nvr.site_name, nvr.host, nvr.port, nvr.user, nvr.password, h, p, u, pw, db],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_nvr(&self, id: i64, nvr: &NewNvrConfig) -> Result<bool> {
        let conn = self.conn.lock();
        let (h, p, u, pw, db) = match &nvr.external_db {
            Some(e) => (
                Some(e.host.clone()),
                Some(e.port),
                Some(e.user.clone()),
                Some(e.password.clone()),
                Some(e.db_name.clone()),
            ),
            None => (None, None, None, None, None),
        };
        let n = conn.execute(
            "UPDATE nvr_config SET site_name = ?2, host = ?3, port = ?4, user = ?5,
                 password = ?6, ext_db_host = ?7, ext_db_port = ?8, ext_db_user = ?9,
                 ext_db_password = ?10, ext_db_name = ?11
             WHERE id = ?1",
            params![id, nvr.site_name, nvr.host, nvr.port, nvr.user, nvr.password, h, p, u, pw, db],
        )?;
        Ok(n == 1)
    }

    /// Cascade-deletes channels and spaces.
    pub fn delete_nvr(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM nvr_config WHERE id = ?1", [id])?;
        Ok(n == 1)
    }

    /// Replace the channel list of one NVR wholesale, in a transaction.
    ///
    /// Every space bbox is re-checked against the reference frame
    /// before anything is written, so a caller bypassing the wire
    /// validation still cannot persist a degenerate region.
    pub fn set_channels(&self, nvr_id: i64, channels: &[NewChannelConfig]) -> Result<()> {
        for ch in channels {
            for sp in &ch.spaces {
                BBox::validated(
                    sp.bbox.x1 as i64,
                    sp.bbox.y1 as i64,
                    sp.bbox.x2 as i64,
                    sp.bbox.y2 as i64,
                )?;
            }
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM channel_config WHERE nvr_id = ?1", [nvr_id])?;
        for (pos, ch) in channels.iter().enumerate() {
            tx.execute(
                "INSERT INTO channel_config
                 (nvr_id, channel_code, camera_ip, display_name, vendor_sn, track_space, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    nvr_id,
                    ch.channel_code.as_str(),
                    ch.camera_ip,
                    ch.display_name,
                    ch.vendor_sn,
                    ch.track_space,
                    pos as i64,
                ],
            )?;
            let channel_id = tx.last_insert_rowid();
            let mut stmt = tx.prepare_cached(
                "INSERT INTO parking_space
                 (channel_id, space_id, space_name, x1, y1, x2, y2, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (spos, sp) in ch.spaces.iter().enumerate() {
                stmt.execute(params![
                    channel_id,
                    sp.space_id,
                    sp.space_name,
                    sp.bbox.x1,
                    sp.bbox.y1,
                    sp.bbox.x2,
                    sp.bbox.y2,
                    spos as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_nvr(&self, id: i64) -> Result<Option<NvrConfig>> {
        let nvrs = self.load_nvrs(Some(id))?;
        Ok(nvrs.into_iter().next())
    }

    pub fn list_nvrs(&self) -> Result<Vec<NvrConfig>> {
        self.load_nvrs(None)
    }

    fn load_nvrs(&self, only: Option<i64>) -> Result<Vec<NvrConfig>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, site_name, host, port, user, password,
                    ext_db_host, ext_db_port, ext_db_user, ext_db_password, ext_db_name
             FROM nvr_config",
        );
        if only.is_some() {
            sql.push_str(" WHERE id = ?1");
        }
        sql.push_str(" ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let map = |row: &rusqlite::Row| -> rusqlite::Result<NvrConfig> {
            let ext_host: Option<String> = row.get(6)?;
            let external_db = match ext_host {
                Some(host) => Some(ExternalDbCoords {
                    host,
                    port: row.get(7)?,
                    user: row.get(8)?,
                    password: row.get(9)?,
                    db_name: row.get(10)?,
                }),
                None => None,
            };
            Ok(NvrConfig {
                id: row.get(0)?,
                site_name: row.get(1)?,
                host: row.get(2)?,
                port: row.get(3)?,
                user: row.get(4)?,
                password: row.get(5)?,
                external_db,
                channels: Vec::new(),
            })
        };
        let mut nvrs = match only {
            Some(id) => stmt
                .query_map([id], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        let mut chan_stmt = conn.prepare_cached(
            "SELECT id, channel_code, camera_ip, display_name, vendor_sn, track_space
             FROM channel_config WHERE nvr_id = ?1 ORDER BY position, id",
        )?;
        let mut space_stmt = conn.prepare_cached(
            "SELECT space_id, space_name, x1, y1, x2, y2
             FROM parking_space WHERE channel_id = ?1 ORDER BY position, id",
        )?;
        for nvr in nvrs.iter_mut() {
            let chans = chan_stmt
                .query_map([nvr.id], |row| {
                    let code: String = row.get(1)?;
                    Ok(ChannelConfig {
                        id: row.get(0)?,
                        channel_code: ChannelCode::parse(&code).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                0,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?,
                        camera_ip: row.get(2)?,
                        display_name: row.get(3)?,
                        vendor_sn: row.get(4)?,
                        track_space: row.get(5)?,
                        spaces: Vec::new(),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut channels = Vec::with_capacity(chans.len());
            for mut ch in chans {
                ch.spaces = space_stmt
                    .query_map([ch.id], |row| {
                        let (x1, y1, x2, y2): (i64, i64, i64, i64) =
                            (row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?);
                        let bbox = BBox::validated(x1, y1, x2, y2).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                2,
                                rusqlite::types::Type::Integer,
                                Box::new(e),
                            )
                        })?;
                        Ok(ParkingSpace {
                            space_id: row.get(0)?,
                            space_name: row.get(1)?,
                            bbox,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                channels.push(ch);
            }
            nvr.channels = channels;
        }
        Ok(nvrs)
    }

    /// Parking spaces of the channel owning `camera_ip` + `channel`,
    /// used by the executor when a capture completes.
    pub fn spaces_for_combo(
        &self,
        camera_ip: &str,
        channel: &ChannelCode,
    ) -> Result<Vec<ParkingSpace>> {
        let conn = self.conn.lock();
        let channel_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM channel_config WHERE camera_ip = ?1 AND channel_code = ?2
                 ORDER BY id LIMIT 1",
                params![camera_ip, channel.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        let Some(channel_id) = channel_id else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare_cached(
            "SELECT space_id, space_name, x1, y1, x2, y2
             FROM parking_space WHERE channel_id = ?1 ORDER BY position, id",
        )?;
        let spaces = stmt
            .query_map([channel_id], |row| {
                let (x1, y1, x2, y2): (i64, i64, i64, i64) =
                    (row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?);
                let bbox = BBox::validated(x1, y1, x2, y2).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Integer,
                        Box::new(e),
                    )
                })?;
                Ok(ParkingSpace {
                    space_id: row.get(0)?,
                    space_name: row.get(1)?,
                    bbox,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(spaces)
    }

    pub fn create_rule(&self, rule: &NewAutoRule) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO auto_rule
             (use_today, custom_date, base_rtsp, channel, interval_minutes, trigger_time, is_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rule.use_today,
                rule.custom_date,
                rule.base_rtsp,
                rule.channel.as_str(),
                rule.interval_minutes,
                rule.trigger_time,
                rule.is_enabled,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_rule(&self, id: i64, rule: &NewAutoRule) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE auto_rule SET use_today = ?2, custom_date = ?3, base_rtsp = ?4,
                 channel = ?5, interval_minutes = ?6, trigger_time = ?7, is_enabled = ?8
             WHERE id = ?1",
            params![
                id,
                rule.use_today,
                rule.custom_date,
                rule.base_rtsp,
                rule.channel.as_str(),
                rule.interval_minutes,
                rule.trigger_time,
                rule.is_enabled,
            ],
        )?;
        Ok(n == 1)
    }

    pub fn delete_rule(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM auto_rule WHERE id = ?1", [id])?;
        Ok(n == 1)
    }

    pub fn list_rules(&self) -> Result<Vec<AutoRule>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {RULE_COLS} FROM auto_rule ORDER BY id"))?;
        let rules = stmt
            .query_map([], rule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    pub fn enabled_rules(&self) -> Result<Vec<AutoRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RULE_COLS} FROM auto_rule WHERE is_enabled ORDER BY id"
        ))?;
        let rules = stmt
            .query_map([], rule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    /// Claim one auto-rule firing for the wall minute starting at
    /// `minute_start`. The conditional update is the duplicate-fire
    /// guard: it succeeds for at most one caller per rule per minute.
    pub fn rule_begin_firing(&self, id: i64, now: DateTime<Utc>, minute_start: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE auto_rule
             SET last_executed_at = ?2, last_execution_status = 'running',
                 last_execution_error = NULL, execution_count = execution_count + 1
             WHERE id = ?1 AND is_enabled
               AND (last_executed_at IS NULL OR last_executed_at < ?3)",
            params![id, millis(&now), millis(&minute_start)],
        )?;
        Ok(n == 1)
    }

    pub fn rule_finish_firing(
        &self,
        id: i64,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE auto_rule SET last_execution_status = ?2, last_execution_error = ?3
             WHERE id = ?1",
            params![id, status.as_str(), error],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn chan(s: &str) -> ChannelCode {
        ChannelCode::parse(s).unwrap()
    }

    fn sample_nvr() -> NewNvrConfig {
        NewNvrConfig {
            site_name: "north lot".into(),
            host: "10.0.0.1".into(),
            port: 8000,
            user: "admin".into(),
            password: "pw".into(),
            external_db: None,
        }
    }

    fn sample_channels() -> Vec<NewChannelConfig> {
        vec![NewChannelConfig {
            channel_code: chan("c1"),
            camera_ip: "10.0.0.11".into(),
            display_name: "gate cam".into(),
            vendor_sn: "SN-1".into(),
            track_space: "[[0,0],[100,0],[100,100]]".into(),
            spaces: vec![
                ParkingSpace {
                    space_id: "A".into(),
                    space_name: "A-01".into(),
                    bbox: BBox::validated(0, 0, 100, 100).unwrap(),
                },
                ParkingSpace {
                    space_id: "B".into(),
                    space_name: "A-02".into(),
                    bbox: BBox::validated(100, 0, 200, 100).unwrap(),
                },
            ],
        }]
    }

    #[test]
    fn nvr_tree_round_trip_and_cascade() {
        let store = Store::open_in_memory().unwrap();
        let id = store.create_nvr(&sample_nvr()).unwrap();
        store.set_channels(id, &sample_channels()).unwrap();

        let nvr = store.get_nvr(id).unwrap().unwrap();
        assert_eq!(nvr.site_name, "north lot");
        assert_eq!(nvr.channels.len(), 1);
        assert_eq!(nvr.channels[0].spaces.len(), 2);
        assert_eq!(nvr.channels[0].spaces[0].space_id, "A");

        let spaces = store.spaces_for_combo("10.0.0.11", &chan("c1")).unwrap();
        assert_eq!(spaces.len(), 2);

        store.delete_nvr(id).unwrap();
        assert!(store.get_nvr(id).unwrap().is_none());
        assert!(store
            .spaces_for_combo("10.0.0.11", &chan("c1"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn set_channels_rejects_bad_bbox() {
        let store = Store::open_in_memory().unwrap();
        let id = store.create_nvr(&sample_nvr()).unwrap();

        let mut channels = sample_channels();
        // Inverted corners, built without going through the validated
        // constructor.
        channels[0].spaces[0].bbox = BBox {
            x1: 1900,
            y1: 1900,
            x2: 100,
            y2: 100,
        };
        assert!(matches!(
            store.set_channels(id, &channels),
            Err(crate::Error::Types(_))
        ));
        // Nothing was written.
        let nvr = store.get_nvr(id).unwrap().unwrap();
        assert!(nvr.channels.is_empty());
    }

    #[test]
    fn rule_fire_dedup_per_minute() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .create_rule(&NewAutoRule {
                use_today: true,
                custom_date: None,
                base_rtsp: "rtsp://u:p@10.0.0.1:554".into(),
                channel: chan("c1"),
                interval_minutes: 60,
                trigger_time: "18:00".into(),
                is_enabled: true,
            })
            .unwrap();

        let minute = Utc.with_ymd_and_hms(2025, 12, 19, 10, 0, 0).unwrap();
        let now = minute + chrono::Duration::seconds(5);

        assert!(store.rule_begin_firing(id, now, minute).unwrap());
        // Second firing in the same minute is refused.
        let now2 = minute + chrono::Duration::seconds(35);
        assert!(!store.rule_begin_firing(id, now2, minute).unwrap());

        // The next minute fires again.
        let next_minute = minute + chrono::Duration::minutes(1);
        assert!(store
            .rule_begin_firing(id, next_minute + chrono::Duration::seconds(1), next_minute)
            .unwrap());

        let rule = store.list_rules().unwrap().pop().unwrap();
        assert_eq!(rule.execution_count, 2);
        assert_eq!(rule.last_execution_status, ExecutionStatus::Running);

        store
            .rule_finish_firing(id, ExecutionStatus::Success, None)
            .unwrap();
        let rule = store.list_rules().unwrap().pop().unwrap();
        assert_eq!(rule.last_execution_status, ExecutionStatus::Success);
    }
}
