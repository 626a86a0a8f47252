//! Message tags shared by both peers.
//!
//! Tag ranges are partitioned by direction:
//! - `DB_*` (100..): database commands and lifecycle notices sent to the client
//! - `COLLECTOR_*` (200..): instrumentation-control commands sent to a collector
//! - `GUI_*` (300..): client-originated notifications (heartbeat, quit)
//!
//! Every tag has a fixed payload layout expressed as a codec format string.

use std::fmt;

/// Which peer a tag is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToClient,
    ToCollector,
}

macro_rules! tags {
    ($( $variant:ident = $value:literal, $name:literal, $format:literal; )*) => {
        /// Wire message discriminator.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i32)]
        pub enum Tag {
            $( $variant = $value, )*
        }

        impl Tag {
            /// Every known tag, in numeric order.
            pub const ALL: &'static [Tag] = &[$( Tag::$variant, )*];

            /// Protocol name, e.g. `DB_INSERT_FILE`.
            pub fn name(self) -> &'static str {
                match self {
                    $( Tag::$variant => $name, )*
                }
            }

            /// Payload layout as a codec format string.
            pub fn format(self) -> &'static str {
                match self {
                    $( Tag::$variant => $format, )*
                }
            }
        }

        impl TryFrom<i32> for Tag {
            type Error = i32;

            fn try_from(value: i32) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok(Tag::$variant), )*
                    other => Err(other),
                }
            }
        }
    };
}

tags! {
    // file name
    DbInsertFile = 101, "DB_INSERT_FILE", "S";
    // function, file, start line, end line
    DbInsertFunction = 102, "DB_INSERT_FUNCTION", "SSII";
    // function, entry key, line, index within line, tooltip
    DbInsertEntry = 103, "DB_INSERT_ENTRY", "SSIIS";
    // ... plus point type, point location, called function, call index
    DbInsertInstPoint = 104, "DB_INSERT_INST_POINT", "SSIISSSSI";
    // tag, description, data type, suggested statistic
    DbDeclareDataAttr = 105, "DB_DECLARE_DATA_ATTR", "SSSS";
    // function, entry, attr, task, thread, value
    DbSetInt = 106, "DB_SET_INT", "SSSIII";
    DbAddInt = 107, "DB_ADD_INT", "SSSIII";
    DbSetDouble = 108, "DB_SET_DOUBLE", "SSSIID";
    DbAddDouble = 109, "DB_ADD_DOUBLE", "SSSIID";
    // action tag, menu text, tooltip, initial state
    DbDeclareAction = 110, "DB_DECLARE_ACTION", "SSSS";
    // action, state, pixmap, menu text, tooltip
    DbDeclareActionState = 111, "DB_DECLARE_ACTION_STATE", "SSSSS";
    // action, from state, to state
    DbEnableTransition = 112, "DB_ENABLE_TRANSITION", "SSS";
    // function, entry, action
    DbEnableAction = 113, "DB_ENABLE_ACTION", "SSS";
    // function, entry, action, task, thread, state
    DbSetActionState = 114, "DB_SET_ACTION_STATE", "SSSIIS";
    DbInsertPtPair = 115, "DB_INSERT_PT_PAIR", "II";
    // folder tag, title
    DbDeclareMessageFolder = 116, "DB_DECLARE_MESSAGE_FOLDER", "SS";
    // folder, text, tracebacks
    DbAddMessage = 117, "DB_ADD_MESSAGE", "SSA";
    DbFunctionParsed = 118, "DB_FUNCTION_PARSED", "S";
    DbFileParsed = 119, "DB_FILE_PARSED", "S";
    // file name, full text (id correlates with the request)
    DbFileContents = 120, "DB_FILE_CONTENTS", "SS";
    // file name, full path
    DbFileFullPath = 121, "DB_FILE_FULL_PATH", "SS";
    DbFileNotFound = 122, "DB_FILE_NOT_FOUND", "S";
    // path, subdirectories
    DbDirectoryListing = 123, "DB_DIRECTORY_LISTING", "SA";
    // program, pid
    DbCollectorHello = 130, "DB_COLLECTOR_HELLO", "SI";
    DbStatus = 131, "DB_STATUS", "S";
    // points matched, actions applied, failures
    DbInstrumentationDone = 132, "DB_INSTRUMENTATION_DONE", "III";
    DbCollectorQuit = 133, "DB_COLLECTOR_QUIT", "S";

    // point tag, action type tag, task (-1 = all processes)
    CollectorActivateAction = 201, "COLLECTOR_ACTIVATE_ACTION", "SSI";
    CollectorDeactivateAction = 202, "COLLECTOR_DEACTIVATE_ACTION", "SS";
    // regexes, point types, point locations, action type tags
    CollectorInstrumentLocations = 203, "COLLECTOR_INSTRUMENT_LOCATIONS", "AAAA";
    CollectorRequestFile = 204, "COLLECTOR_REQUEST_FILE", "S";
    CollectorCancelFileRequest = 205, "COLLECTOR_CANCEL_FILE_REQUEST", "S";
    CollectorRequestDirectory = 206, "COLLECTOR_REQUEST_DIRECTORY", "S";

    GuiHeartbeat = 301, "GUI_HEARTBEAT", "";
    GuiQuit = 302, "GUI_QUIT", "S";
}

impl Tag {
    pub fn direction(self) -> Direction {
        if (self as i32) < 200 {
            Direction::ToClient
        } else {
            Direction::ToCollector
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tag_values_round_trip() {
        for tag in Tag::ALL {
            assert_eq!(Tag::try_from(*tag as i32), Ok(*tag));
        }
        assert_eq!(Tag::try_from(9999), Err(9999));
    }

    #[test]
    fn test_names_follow_direction_prefix() {
        let mut names = HashSet::new();
        for tag in Tag::ALL {
            assert!(names.insert(tag.name()), "duplicate name {}", tag.name());
            match tag.direction() {
                Direction::ToClient => assert!(tag.name().starts_with("DB_")),
                Direction::ToCollector => assert!(
                    tag.name().starts_with("COLLECTOR_") || tag.name().starts_with("GUI_")
                ),
            }
        }
    }

    #[test]
    fn test_formats_only_use_known_codes() {
        for tag in Tag::ALL {
            assert!(tag.format().chars().all(|c| "IDSA".contains(c)), "{tag}");
        }
    }
}
