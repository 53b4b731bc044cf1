//! Persisted schedule document format.
//!
//! ```json
//! {"1": {"length": 101, "slots": [
//!     {"slotOffset": 0, "channelOffset": 0, "cellType": "TXRX"},
//!     {"slotOffset": 5, "channelOffset": 3, "cellType": "TX", "owner": 2, "neighbor": 1}
//! ]}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Cell, CellType, FrameId, MotePair, Schedule, ScheduleError, Slotframe, SlotOffset};
use crate::topology::MoteId;

/// Raw document keyed by slotframe id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleDocument(pub BTreeMap<u16, FrameDocument>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDocument {
    pub length: u16,
    #[serde(default)]
    pub slots: Vec<SlotDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotDocument {
    pub slot_offset: SlotOffset,
    pub channel_offset: u8,
    pub cell_type: CellType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<MoteId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighbor: Option<MoteId>,
}

impl SlotDocument {
    fn into_cell(self, frame: FrameId) -> Result<Cell, ScheduleError> {
        let assignment = match (self.owner, self.neighbor) {
            (Some(owner), Some(neighbor)) => Some(MotePair::new(owner, neighbor)),
            (None, None) => None,
            _ => {
                return Err(ScheduleError::IncompleteAssignment {
                    frame,
                    slot_offset: self.slot_offset,
                });
            }
        };
        Ok(Cell {
            slot_offset: self.slot_offset,
            channel_offset: self.channel_offset,
            cell_type: self.cell_type,
            assignment,
        })
    }
}

impl From<&Cell> for SlotDocument {
    fn from(cell: &Cell) -> Self {
        Self {
            slot_offset: cell.slot_offset,
            channel_offset: cell.channel_offset,
            cell_type: cell.cell_type,
            owner: cell.assignment.map(|pair| pair.owner),
            neighbor: cell.assignment.map(|pair| pair.neighbor),
        }
    }
}

impl TryFrom<ScheduleDocument> for Schedule {
    type Error = ScheduleError;

    fn try_from(document: ScheduleDocument) -> Result<Self, Self::Error> {
        let mut schedule = Schedule::new();
        for (id, frame_document) in document.0 {
            let id = FrameId::new(id);
            let mut frame = Slotframe::new(id, frame_document.length)?;
            for slot in frame_document.slots {
                frame.insert_cell(slot.into_cell(id)?)?;
            }
            schedule.insert_frame(frame);
        }
        Ok(schedule)
    }
}

impl From<Schedule> for ScheduleDocument {
    fn from(schedule: Schedule) -> Self {
        let frames = schedule
            .frames()
            .map(|frame| {
                (
                    frame.id().as_u16(),
                    FrameDocument {
                        length: frame.length(),
                        slots: frame.cells().map(SlotDocument::from).collect(),
                    },
                )
            })
            .collect();
        Self(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "1": {
            "length": 101,
            "slots": [
                {"slotOffset": 0, "channelOffset": 0, "cellType": "TXRX"},
                {"slotOffset": 5, "channelOffset": 3, "cellType": "TX", "owner": 2, "neighbor": 1}
            ]
        },
        "2": {"length": 11}
    }"#;

    #[test]
    fn test_parse_document() {
        let schedule = Schedule::from_json_str(DOCUMENT).unwrap();
        assert_eq!(schedule.frame_ids(), vec![FrameId::new(1), FrameId::new(2)]);

        let frame = schedule.frame(FrameId::new(1)).unwrap();
        assert_eq!(frame.length(), 101);
        let cells: Vec<_> = frame.cells().copied().collect();
        assert_eq!(cells[0], Cell::shared(0, 0));
        assert_eq!(
            cells[1],
            Cell::dedicated(5, 3, CellType::Tx, MoteId::new(2), MoteId::new(1))
        );
        assert!(schedule.frame(FrameId::new(2)).unwrap().is_empty());
    }

    #[test]
    fn test_document_survives_reserialization() {
        let schedule = Schedule::from_json_str(DOCUMENT).unwrap();
        let text = schedule.to_json_string().unwrap();
        assert_eq!(Schedule::from_json_str(&text).unwrap(), schedule);

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["1"]["slots"][0]["cellType"], "TXRX");
        assert!(value["1"]["slots"][0].get("owner").is_none());
    }

    #[test]
    fn test_malformed_documents_rejected() {
        let cases = [
            "not json",
            r#"{"1": {"length": 0, "slots": []}}"#,
            r#"{"1": {"length": 4, "slots": [{"slotOffset": 4, "channelOffset": 0, "cellType": "TX"}]}}"#,
            r#"{"1": {"length": 4, "slots": [{"slotOffset": 1, "channelOffset": 0, "cellType": "BEACON"}]}}"#,
            r#"{"1": {"length": 4, "slots": [{"slotOffset": 1, "channelOffset": 0, "cellType": "TX", "owner": 2}]}}"#,
            r#"{"x": {"length": 4}}"#,
        ];
        for case in cases {
            assert!(
                matches!(
                    Schedule::from_json_str(case),
                    Err(ScheduleError::ConfigLoad { .. })
                ),
                "accepted malformed document: {case}"
            );
        }
    }
}
