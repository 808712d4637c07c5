//! Tags and enumerations used by the session layer.
//!
//! Only the fields the administrative protocol touches are listed here;
//! application-level dictionaries are out of scope for the session layer
//! and callers pass raw tag numbers for anything else.

/// Header, trailer and admin-body tags the session layer reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Tags {
    BeginSeqNo = 7,
    BeginString = 8,
    BodyLength = 9,
    CheckSum = 10,
    EndSeqNo = 16,
    MsgSeqNum = 34,
    MsgType = 35,
    NewSeqNo = 36,
    PossDupFlag = 43,
    RefSeqNum = 45,
    SenderCompID = 49,
    SendingTime = 52,
    TargetCompID = 56,
    Text = 58,
    EncryptMethod = 98,
    HeartBtInt = 108,
    TestReqID = 112,
    OrigSendingTime = 122,
    GapFillFlag = 123,
    ResetSeqNumFlag = 141,
    RefTagID = 371,
    RefMsgType = 372,
    SessionRejectReason = 373,
    BusinessRejectRefID = 379,
    BusinessRejectReason = 380,
    DefaultApplVerID = 1137,
}

impl From<Tags> for u32 {
    fn from(t: Tags) -> u32 {
        t as u32
    }
}

impl TryFrom<u32> for Tags {
    type Error = u32;
    fn try_from(v: u32) -> Result<Tags, u32> {
        let tag = match v {
            7 => Tags::BeginSeqNo,
            8 => Tags::BeginString,
            9 => Tags::BodyLength,
            10 => Tags::CheckSum,
            16 => Tags::EndSeqNo,
            34 => Tags::MsgSeqNum,
            35 => Tags::MsgType,
            36 => Tags::NewSeqNo,
            43 => Tags::PossDupFlag,
            45 => Tags::RefSeqNum,
            49 => Tags::SenderCompID,
            52 => Tags::SendingTime,
            56 => Tags::TargetCompID,
            58 => Tags::Text,
            98 => Tags::EncryptMethod,
            108 => Tags::HeartBtInt,
            112 => Tags::TestReqID,
            122 => Tags::OrigSendingTime,
            123 => Tags::GapFillFlag,
            141 => Tags::ResetSeqNumFlag,
            371 => Tags::RefTagID,
            372 => Tags::RefMsgType,
            373 => Tags::SessionRejectReason,
            379 => Tags::BusinessRejectRefID,
            380 => Tags::BusinessRejectReason,
            1137 => Tags::DefaultApplVerID,
            other => return Err(other),
        };
        Ok(tag)
    }
}

/// Administrative message types, plus a catch-all for application types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Heartbeat,
    TestRequest,
    ResendRequest,
    Reject,
    SequenceReset,
    Logout,
    Logon,
    BusinessReject,
    Application(char),
}

impl MsgType {
    pub fn is_admin(&self) -> bool {
        !matches!(self, MsgType::Application(_))
    }

    pub fn as_char(&self) -> char {
        match self {
            MsgType::Heartbeat => '0',
            MsgType::TestRequest => '1',
            MsgType::ResendRequest => '2',
            MsgType::Reject => '3',
            MsgType::SequenceReset => '4',
            MsgType::Logout => '5',
            MsgType::Logon => 'A',
            MsgType::BusinessReject => 'j',
            MsgType::Application(c) => *c,
        }
    }
}

impl From<char> for MsgType {
    fn from(c: char) -> MsgType {
        match c {
            '0' => MsgType::Heartbeat,
            '1' => MsgType::TestRequest,
            '2' => MsgType::ResendRequest,
            '3' => MsgType::Reject,
            '4' => MsgType::SequenceReset,
            '5' => MsgType::Logout,
            'A' => MsgType::Logon,
            'j' => MsgType::BusinessReject,
            other => MsgType::Application(other),
        }
    }
}

impl From<MsgType> for char {
    fn from(m: MsgType) -> char {
        m.as_char()
    }
}

/// SessionRejectReason(373) codes emitted by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRejectReason {
    RequiredTagMissing,
    ValueIsIncorrect,
    IncorrectDataFormatForValue,
    CompIdProblem,
    SendingTimeAccuracyProblem,
    InvalidMsgType,
}

impl SessionRejectReason {
    pub fn code(&self) -> u32 {
        match self {
            SessionRejectReason::RequiredTagMissing => 1,
            SessionRejectReason::ValueIsIncorrect => 5,
            SessionRejectReason::IncorrectDataFormatForValue => 6,
            SessionRejectReason::CompIdProblem => 9,
            SessionRejectReason::SendingTimeAccuracyProblem => 10,
            SessionRejectReason::InvalidMsgType => 11,
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            SessionRejectReason::RequiredTagMissing => "Required tag missing",
            SessionRejectReason::ValueIsIncorrect => "Value is incorrect",
            SessionRejectReason::IncorrectDataFormatForValue => {
                "Incorrect data format for value"
            }
            SessionRejectReason::CompIdProblem => "CompID problem",
            SessionRejectReason::SendingTimeAccuracyProblem => "SendingTime accuracy problem",
            SessionRejectReason::InvalidMsgType => "Invalid MsgType",
        }
    }
}

/// DefaultApplVerID(1137) value for FIX 5.0 SP2 sessions over FIXT.1.1.
pub const APPL_VER_ID_FIX50SP2: &[u8] = b"9";
